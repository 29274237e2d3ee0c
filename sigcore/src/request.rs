use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// An outgoing request sent over the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRequest {
    pub verb: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Overrides the connection-wide default when set.
    pub timeout: Option<Duration>,
}

impl SocketRequest {
    pub fn new(verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new("PUT", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new("DELETE", path)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header("content-type", "application/json")
            .with_body(body))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The peer's answer to a [`SocketRequest`], matched by correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketResponse {
    pub id: u64,
    pub status: u16,
    pub message: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl SocketResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.body.as_deref().unwrap_or_default())
    }
}

/// A request initiated by the peer (e.g. a queued message delivery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    pub id: u64,
    pub verb: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl ServerRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub(crate) fn format_header(name: &str, value: &str) -> String {
    format!("{name}:{value}")
}

/// Headers travel as `name:value`; entries without a colon are dropped.
pub(crate) fn parse_header(raw: &str) -> Option<(String, String)> {
    let (name, value) = raw.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Count {
        count: u32,
    }

    #[test]
    fn json_body_sets_content_type() {
        let req = SocketRequest::put("/v2/keys")
            .with_json(&Count { count: 3 })
            .unwrap();
        assert_eq!(req.body.as_deref(), Some(br#"{"count":3}"#.as_slice()));
        assert_eq!(
            req.headers,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn response_helpers() {
        let resp = SocketResponse {
            id: 1,
            status: 200,
            message: Some("OK".into()),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: Some(Bytes::from_static(br#"{"count":12}"#)),
        };
        assert!(resp.is_success());
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.json::<Count>().unwrap(), Count { count: 12 });

        let failed = SocketResponse {
            status: 413,
            body: None,
            ..resp
        };
        assert!(!failed.is_success());
        assert!(failed.json::<Count>().is_err());
    }

    #[test]
    fn header_parsing_trims_and_rejects_garbage() {
        assert_eq!(
            parse_header("X-Signal-Timestamp: 12345"),
            Some(("X-Signal-Timestamp".into(), "12345".into()))
        );
        assert_eq!(parse_header("no-colon-here"), None);
        assert_eq!(format_header("a", "b"), "a:b");
    }
}
