//! Wire framing for the socket: every transport message is one
//! `WebSocketMessage` protobuf carrying either a request or a response.

use crate::request::{ServerRequest, SocketRequest, SocketResponse, format_header, parse_header};
use bytes::Bytes;
use prost::Message;
use sigproto::signalservice::web_socket_message::Type as MessageType;
use sigproto::signalservice::{WebSocketMessage, WebSocketRequestMessage, WebSocketResponseMessage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to decode frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("frame is missing {0}")]
    Missing(&'static str),
    #[error("unsupported frame type {0}")]
    UnsupportedType(i32),
    #[error("response status {0} out of range")]
    InvalidStatus(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Response(SocketResponse),
    Request(ServerRequest),
}

pub fn encode_request(id: u64, request: &SocketRequest) -> Vec<u8> {
    let message = WebSocketMessage {
        r#type: Some(MessageType::Request as i32),
        request: Some(WebSocketRequestMessage {
            verb: Some(request.verb.clone()),
            path: Some(request.path.clone()),
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| format_header(k, v))
                .collect(),
            id: Some(id),
        }),
        response: None,
    };
    message.encode_to_vec()
}

/// Answers a server-initiated request.
pub fn encode_response(id: u64, status: u16, message: &str, body: Option<&[u8]>) -> Vec<u8> {
    let frame = WebSocketMessage {
        r#type: Some(MessageType::Response as i32),
        request: None,
        response: Some(WebSocketResponseMessage {
            id: Some(id),
            status: Some(u32::from(status)),
            message: Some(message.to_string()),
            headers: Vec::new(),
            body: body.map(<[u8]>::to_vec),
        }),
    };
    frame.encode_to_vec()
}

pub fn decode_frame(data: &[u8]) -> Result<InboundFrame, FrameError> {
    let message = WebSocketMessage::decode(data)?;
    let kind = message.r#type.unwrap_or(MessageType::Unknown as i32);

    match MessageType::try_from(kind) {
        Ok(MessageType::Response) => {
            let response = message.response.ok_or(FrameError::Missing("response"))?;
            let id = response.id.ok_or(FrameError::Missing("response id"))?;
            let raw_status = response.status.unwrap_or(0);
            let status =
                u16::try_from(raw_status).map_err(|_| FrameError::InvalidStatus(raw_status))?;
            Ok(InboundFrame::Response(SocketResponse {
                id,
                status,
                message: response.message,
                headers: response
                    .headers
                    .iter()
                    .filter_map(|h| parse_header(h))
                    .collect(),
                body: response.body.map(Bytes::from),
            }))
        }
        Ok(MessageType::Request) => {
            let request = message.request.ok_or(FrameError::Missing("request"))?;
            Ok(InboundFrame::Request(ServerRequest {
                id: request.id.ok_or(FrameError::Missing("request id"))?,
                verb: request.verb.ok_or(FrameError::Missing("request verb"))?,
                path: request.path.ok_or(FrameError::Missing("request path"))?,
                headers: request
                    .headers
                    .iter()
                    .filter_map(|h| parse_header(h))
                    .collect(),
                body: request.body.map(Bytes::from),
            }))
        }
        _ => Err(FrameError::UnsupportedType(kind)),
    }
}
