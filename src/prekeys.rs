use crate::socket::{RequestError, SocketManager};
use crate::store::{KeyMaterialStore, KeyStoreError};
use log::{debug, info};
use sigcore::builders::{
    AvailablePreKeysResponse, available_pre_keys_request, register_pre_keys_request,
};
use sigcore::curve::IdentityKeyPair;
use sigcore::prekeys::{PRE_KEY_BATCH_SIZE, PRE_KEY_MINIMUM_COUNT, PreKeyId, SignedPreKeyId};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    #[error("malformed key count response: {0}")]
    InvalidResponse(#[source] serde_json::Error),
}

/// What a successful upload put on the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedKeys {
    pub pre_key_ids: Vec<PreKeyId>,
    pub signed_pre_key_id: SignedPreKeyId,
    pub last_resort_key_id: PreKeyId,
}

/// Keeps the service stocked with one-time pre-keys for this device.
pub struct PreKeyPublisher {
    socket: Arc<SocketManager>,
    keys: Arc<KeyMaterialStore>,
}

impl PreKeyPublisher {
    pub fn new(socket: Arc<SocketManager>, keys: Arc<KeyMaterialStore>) -> Self {
        Self { socket, keys }
    }

    /// Number of unused one-time pre-keys the service still holds.
    pub async fn available_pre_key_count(&self) -> Result<u32, PublishError> {
        let response = self.socket.send_request(available_pre_keys_request()).await?;
        let body: AvailablePreKeysResponse =
            response.json().map_err(PublishError::InvalidResponse)?;
        debug!(target: "PreKeys", "Service holds {} pre-keys", body.count);
        Ok(body.count)
    }

    /// Generates and uploads a fresh batch, a new signed pre-key and the
    /// last-resort key. Keys are persisted before the upload so the service
    /// never hands out a key this device cannot find.
    pub async fn publish_pre_keys(
        &self,
        identity: &IdentityKeyPair,
    ) -> Result<PublishedKeys, PublishError> {
        let pre_keys = self.keys.generate_key_records(PRE_KEY_BATCH_SIZE).await?;
        let signed_pre_key = self.keys.generate_signed_key_record(identity).await?;
        let last_resort_key = self.keys.get_or_generate_last_resort_key().await?;

        self.keys.store_key_records(&pre_keys).await?;
        self.keys.store_signed_key_record(&signed_pre_key).await?;

        let request = register_pre_keys_request(
            identity.public_key(),
            &signed_pre_key,
            &pre_keys,
            &last_resort_key,
        )
        .map_err(RequestError::from)?;
        self.socket.send_request(request).await?;

        self.keys
            .set_current_signed_key_id(signed_pre_key.id())
            .await?;
        info!(
            target: "PreKeys",
            "Published {} pre-keys and signed pre-key {}",
            pre_keys.len(),
            signed_pre_key.id()
        );

        Ok(PublishedKeys {
            pre_key_ids: pre_keys.iter().map(|k| k.id()).collect(),
            signed_pre_key_id: signed_pre_key.id(),
            last_resort_key_id: last_resort_key.id(),
        })
    }

    /// Publishes a new batch when the service is running low. Returns `None`
    /// when nothing was needed.
    pub async fn refresh_if_needed(
        &self,
        identity: &IdentityKeyPair,
    ) -> Result<Option<PublishedKeys>, PublishError> {
        let count = self.available_pre_key_count().await?;
        if count >= PRE_KEY_MINIMUM_COUNT {
            debug!(target: "PreKeys", "{count} pre-keys available, no refresh needed");
            return Ok(None);
        }
        info!(target: "PreKeys", "Only {count} pre-keys left, publishing a new batch");
        self.publish_pre_keys(identity).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketConfig;
    use crate::store::InMemoryBackend;
    use crate::transport::mock::{MockPeer, MockTransportFactory};
    use sigcore::frame::{InboundFrame, decode_frame, encode_response};
    use sigcore::prekeys::LAST_RESORT_KEY_ID;
    use sigcore::socket::ConnectionState;
    use std::sync::Mutex;

    /// Answers key requests like the service would and records uploads.
    fn serve(mut peer: MockPeer, available: u32, status: u16) -> Arc<Mutex<Vec<serde_json::Value>>> {
        let uploads = Arc::new(Mutex::new(Vec::new()));
        let recorded = uploads.clone();
        tokio::spawn(async move {
            while let Some(frame) = peer.sent.recv().await {
                let InboundFrame::Request(request) = decode_frame(&frame).unwrap() else {
                    continue;
                };
                let reply = match request.verb.as_str() {
                    "GET" => {
                        let body = serde_json::json!({ "count": available }).to_string();
                        encode_response(request.id, 200, "OK", Some(body.as_bytes()))
                    }
                    _ => {
                        let body: serde_json::Value =
                            serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
                        recorded.lock().unwrap().push(body);
                        encode_response(request.id, status, "OK", None)
                    }
                };
                peer.deliver(reply).await;
            }
        });
        uploads
    }

    async fn setup(
        available: u32,
        status: u16,
    ) -> (PreKeyPublisher, Arc<KeyMaterialStore>, Arc<Mutex<Vec<serde_json::Value>>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (factory, mut peers) = MockTransportFactory::new();
        let socket = SocketManager::new(SocketConfig::default(), Arc::new(factory));
        let mut changes = socket.state_changes();
        socket.request_open();
        let uploads = serve(peers.recv().await.unwrap(), available, status);
        changes
            .wait_for(|s| *s == ConnectionState::Open)
            .await
            .unwrap();

        let keys = Arc::new(KeyMaterialStore::new(Arc::new(InMemoryBackend::new())));
        (PreKeyPublisher::new(socket, keys.clone()), keys, uploads)
    }

    #[tokio::test]
    async fn publish_uploads_and_persists_bundle() {
        let (publisher, keys, uploads) = setup(0, 200).await;
        let identity = IdentityKeyPair::generate(&mut rand::rng());

        let published = publisher.publish_pre_keys(&identity).await.unwrap();
        assert_eq!(published.pre_key_ids.len(), PRE_KEY_BATCH_SIZE);
        assert_eq!(published.last_resort_key_id, LAST_RESORT_KEY_ID);
        assert!(!published.pre_key_ids.contains(&LAST_RESORT_KEY_ID));

        for id in &published.pre_key_ids {
            assert!(keys.contains_key_record(*id).await.unwrap());
        }
        assert_eq!(
            keys.current_signed_key_id().await.unwrap(),
            Some(published.signed_pre_key_id)
        );

        let uploads = uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        let body = &uploads[0];
        assert_eq!(body["preKeys"].as_array().unwrap().len(), PRE_KEY_BATCH_SIZE);
        assert_eq!(body["signedPreKey"]["keyId"], published.signed_pre_key_id);
        assert_eq!(body["lastResortKey"]["keyId"], LAST_RESORT_KEY_ID);
        assert!(body["identityKey"].is_string());
    }

    #[tokio::test]
    async fn rejected_upload_leaves_current_signed_key_alone() {
        let (publisher, keys, _) = setup(0, 422).await;
        let identity = IdentityKeyPair::generate(&mut rand::rng());

        let err = publisher.publish_pre_keys(&identity).await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::Request(RequestError::ServerError { status: 422, .. })
        ));
        assert_eq!(keys.current_signed_key_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn refresh_only_below_threshold() {
        let (publisher, _, uploads) = setup(PRE_KEY_MINIMUM_COUNT, 200).await;
        let identity = IdentityKeyPair::generate(&mut rand::rng());
        assert_eq!(
            publisher.available_pre_key_count().await.unwrap(),
            PRE_KEY_MINIMUM_COUNT
        );
        assert!(publisher.refresh_if_needed(&identity).await.unwrap().is_none());
        assert!(uploads.lock().unwrap().is_empty());

        let (publisher, _, uploads) = setup(PRE_KEY_MINIMUM_COUNT - 1, 200).await;
        assert!(publisher.refresh_if_needed(&identity).await.unwrap().is_some());
        assert_eq!(uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publishing_requires_a_connection() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (factory, _peers) = MockTransportFactory::new();
        let socket = SocketManager::new(SocketConfig::default(), Arc::new(factory));
        let keys = Arc::new(KeyMaterialStore::new(Arc::new(InMemoryBackend::new())));
        let publisher = PreKeyPublisher::new(socket, keys);

        let err = publisher.available_pre_key_count().await.unwrap_err();
        assert!(matches!(err, PublishError::Request(RequestError::NotConnected)));
    }
}
