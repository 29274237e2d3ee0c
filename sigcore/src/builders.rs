//! Builders for the service requests this crate issues itself.

use crate::curve::PublicKey;
use crate::prekeys::{KeyRecord, PreKeyId, SignedKeyRecord, SignedPreKeyId};
use crate::request::SocketRequest;
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use serde::{Deserialize, Serialize};

pub const KEEPALIVE_PATH: &str = "/v1/keepalive";
pub const KEYS_PATH: &str = "/v2/keys";
pub const PROFILE_NAME_PATH: &str = "/v1/profile/name";

pub fn keepalive_request() -> SocketRequest {
    SocketRequest::get(KEEPALIVE_PATH)
}

pub fn available_pre_keys_request() -> SocketRequest {
    SocketRequest::get(KEYS_PATH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailablePreKeysResponse {
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreKeyEntity {
    key_id: PreKeyId,
    public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedPreKeyEntity {
    key_id: SignedPreKeyId,
    public_key: String,
    signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterKeysBody {
    identity_key: String,
    pre_keys: Vec<PreKeyEntity>,
    signed_pre_key: SignedPreKeyEntity,
    last_resort_key: PreKeyEntity,
}

fn encode_key(key: &PublicKey) -> String {
    STANDARD_NO_PAD.encode(key.serialize())
}

fn pre_key_entity(record: &KeyRecord) -> PreKeyEntity {
    PreKeyEntity {
        key_id: record.id(),
        public_key: encode_key(&record.key_pair().public_key),
    }
}

/// Uploads a full key bundle, replacing whatever the service held before.
pub fn register_pre_keys_request(
    identity_key: &PublicKey,
    signed_pre_key: &SignedKeyRecord,
    pre_keys: &[KeyRecord],
    last_resort_key: &KeyRecord,
) -> Result<SocketRequest, serde_json::Error> {
    let body = RegisterKeysBody {
        identity_key: encode_key(identity_key),
        pre_keys: pre_keys.iter().map(pre_key_entity).collect(),
        signed_pre_key: SignedPreKeyEntity {
            key_id: signed_pre_key.id(),
            public_key: encode_key(&signed_pre_key.key_pair().public_key),
            signature: STANDARD_NO_PAD.encode(signed_pre_key.signature()),
        },
        last_resort_key: pre_key_entity(last_resort_key),
    };
    SocketRequest::put(KEYS_PATH).with_json(&body)
}

/// Sets the encrypted profile name. `None` clears it.
pub fn profile_name_set_request(encrypted_padded_name: Option<&[u8]>) -> SocketRequest {
    match encrypted_padded_name {
        Some(name) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(name);
            SocketRequest::put(format!(
                "{PROFILE_NAME_PATH}/{}",
                urlencoding::encode(&encoded)
            ))
        }
        None => SocketRequest::put(PROFILE_NAME_PATH),
    }
}

/// Variant used by servers that accept an unencrypted display name.
pub fn profile_name_set_request_plain_text(profile_name: &str) -> SocketRequest {
    if profile_name.is_empty() {
        return SocketRequest::put(PROFILE_NAME_PATH);
    }
    SocketRequest::put(format!(
        "{PROFILE_NAME_PATH}/{}",
        urlencoding::encode(profile_name)
    ))
}
