use crate::curve::{CurveError, IdentityKeyPair, KeyPair, SIGNATURE_LENGTH};
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use prost::Message;
use rand::{CryptoRng, RngCore};
use sigproto::signalservice::{PreKeyRecordStructure, SignedPreKeyRecordStructure};
use std::collections::HashSet;
use thiserror::Error;

pub type PreKeyId = u32;
pub type SignedPreKeyId = u32;

/// Pre-key ids are 24-bit on the wire.
pub const MAX_PRE_KEY_ID: u32 = 0x00FF_FFFF;
/// Lives outside the disposable id range so it can never collide with a
/// one-time pre-key.
pub const LAST_RESORT_KEY_ID: PreKeyId = MAX_PRE_KEY_ID;
pub const PRE_KEY_BATCH_SIZE: usize = 100;
/// Publish a fresh batch when the service holds fewer than this many keys.
pub const PRE_KEY_MINIMUM_COUNT: u32 = 35;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to decode key record: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("key record is missing field `{0}`")]
    MissingField(&'static str),
    #[error("key record holds an invalid key: {0}")]
    InvalidKey(#[from] CurveError),
    #[error("signed key record has a malformed signature ({0} bytes)")]
    InvalidSignature(usize),
}

/// One disposable pre-key. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    id: PreKeyId,
    key_pair: KeyPair,
}

impl KeyRecord {
    pub fn new(id: PreKeyId, key_pair: KeyPair) -> Self {
        Self { id, key_pair }
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn to_structure(&self) -> PreKeyRecordStructure {
        PreKeyRecordStructure {
            id: Some(self.id),
            public_key: Some(self.key_pair.public_key.public_key_bytes().to_vec()),
            private_key: Some(self.key_pair.private_key.serialize()),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.to_structure().encode_to_vec()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, RecordError> {
        Self::try_from(PreKeyRecordStructure::decode(bytes)?)
    }
}

impl TryFrom<PreKeyRecordStructure> for KeyRecord {
    type Error = RecordError;

    fn try_from(structure: PreKeyRecordStructure) -> Result<Self, Self::Error> {
        let id = structure.id.ok_or(RecordError::MissingField("id"))?;
        let public = structure
            .public_key
            .ok_or(RecordError::MissingField("public_key"))?;
        let private = structure
            .private_key
            .ok_or(RecordError::MissingField("private_key"))?;
        Ok(Self::new(id, KeyPair::from_parts(&public, &private)?))
    }
}

/// A pre-key signed by the identity key. Rotated periodically; older records
/// stay in the store until the caller removes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedKeyRecord {
    id: SignedPreKeyId,
    key_pair: KeyPair,
    signature: [u8; SIGNATURE_LENGTH],
    signed_at: DateTime<Utc>,
}

impl SignedKeyRecord {
    /// `signed_at` is kept at millisecond precision, the precision it is
    /// stored with.
    pub fn new(
        id: SignedPreKeyId,
        key_pair: KeyPair,
        signature: [u8; SIGNATURE_LENGTH],
        signed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            key_pair,
            signature,
            signed_at: signed_at.trunc_subsecs(3),
        }
    }

    /// Creates a record whose signature covers the serialized public key.
    pub fn generate<R>(
        id: SignedPreKeyId,
        identity: &IdentityKeyPair,
        signed_at: DateTime<Utc>,
        csprng: &mut R,
    ) -> Self
    where
        R: CryptoRng + RngCore,
    {
        let key_pair = KeyPair::generate(csprng);
        let signature = identity.sign(&key_pair.public_key.serialize(), csprng);
        Self::new(id, key_pair, signature, signed_at)
    }

    pub fn id(&self) -> SignedPreKeyId {
        self.id
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.signature
    }

    pub fn signed_at(&self) -> DateTime<Utc> {
        self.signed_at
    }

    pub fn verify(&self, identity: &crate::curve::PublicKey) -> bool {
        identity.verify_signature(&self.key_pair.public_key.serialize(), &self.signature)
    }

    pub fn to_structure(&self) -> SignedPreKeyRecordStructure {
        SignedPreKeyRecordStructure {
            id: Some(self.id),
            public_key: Some(self.key_pair.public_key.public_key_bytes().to_vec()),
            private_key: Some(self.key_pair.private_key.serialize()),
            signature: Some(self.signature.to_vec()),
            timestamp: Some(self.signed_at.timestamp_millis().max(0) as u64),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.to_structure().encode_to_vec()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, RecordError> {
        Self::try_from(SignedPreKeyRecordStructure::decode(bytes)?)
    }
}

impl TryFrom<SignedPreKeyRecordStructure> for SignedKeyRecord {
    type Error = RecordError;

    fn try_from(structure: SignedPreKeyRecordStructure) -> Result<Self, Self::Error> {
        let id = structure.id.ok_or(RecordError::MissingField("id"))?;
        let public = structure
            .public_key
            .ok_or(RecordError::MissingField("public_key"))?;
        let private = structure
            .private_key
            .ok_or(RecordError::MissingField("private_key"))?;
        let signature_bytes = structure
            .signature
            .ok_or(RecordError::MissingField("signature"))?;
        let signature: [u8; SIGNATURE_LENGTH] = signature_bytes
            .as_slice()
            .try_into()
            .map_err(|_| RecordError::InvalidSignature(signature_bytes.len()))?;
        let millis = structure.timestamp.unwrap_or(0);
        let signed_at = Utc
            .timestamp_millis_opt(i64::try_from(millis).unwrap_or(i64::MAX))
            .single()
            .unwrap_or_default();
        Ok(Self::new(
            id,
            KeyPair::from_parts(&public, &private)?,
            signature,
            signed_at,
        ))
    }
}

/// Half-open range of ids handed out to disposable pre-keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    start: u32,
    end: u32,
}

impl IdRange {
    /// `start..end`; an empty range is widened to a single id.
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end: end.max(start.saturating_add(1)),
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> u64 {
        u64::from(self.end - self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u32) -> bool {
        (self.start..self.end).contains(&id)
    }

    fn successor(&self, id: u32) -> u32 {
        if id + 1 >= self.end { self.start } else { id + 1 }
    }
}

impl Default for IdRange {
    fn default() -> Self {
        Self::new(0, MAX_PRE_KEY_ID)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no free pre-key id left: requested {requested}, found {found}")]
pub struct IdSpaceExhausted {
    pub requested: usize,
    pub found: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAllocation {
    pub ids: Vec<PreKeyId>,
    /// Where the following allocation continues from.
    pub next: PreKeyId,
}

/// Hands out `count` ids continuing from `next`, wrapping to the start of the
/// range after its end and skipping ids in `taken`. Ids are never reused while
/// a record holding them is still live.
pub fn allocate_ids(
    range: IdRange,
    next: PreKeyId,
    count: usize,
    taken: &HashSet<PreKeyId>,
) -> Result<IdAllocation, IdSpaceExhausted> {
    let mut candidate = if range.contains(next) { next } else { range.start };
    let mut ids = Vec::with_capacity(count.min(range.len() as usize));
    let mut scanned: u64 = 0;

    while ids.len() < count {
        if scanned == range.len() {
            return Err(IdSpaceExhausted {
                requested: count,
                found: ids.len(),
            });
        }
        if !taken.contains(&candidate) {
            ids.push(candidate);
        }
        scanned += 1;
        candidate = range.successor(candidate);
    }

    Ok(IdAllocation {
        ids,
        next: candidate,
    })
}

/// Signed pre-key ids follow their own 24-bit counter.
pub fn next_signed_pre_key_id(current: SignedPreKeyId) -> SignedPreKeyId {
    (current % MAX_PRE_KEY_ID) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_continues_instead_of_reusing_freed_ids() {
        let range = IdRange::default();
        let first = allocate_ids(range, 0, 10, &HashSet::new()).unwrap();
        assert_eq!(first.ids, (0..10).collect::<Vec<_>>());
        assert_eq!(first.next, 10);

        // id 5 was consumed and removed; the next id still continues at 10
        let live: HashSet<u32> = (0..10).filter(|id| *id != 5).collect();
        let second = allocate_ids(range, first.next, 1, &live).unwrap();
        assert_eq!(second.ids, vec![10]);
    }

    #[test]
    fn allocation_wraps_and_skips_live_ids() {
        let range = IdRange::new(0, 8);
        let live: HashSet<u32> = [0, 1, 3].into_iter().collect();

        let alloc = allocate_ids(range, 6, 4, &live).unwrap();
        assert_eq!(alloc.ids, vec![6, 7, 2, 4]);
        assert_eq!(alloc.next, 5);
    }

    #[test]
    fn allocation_fails_when_no_free_id_remains() {
        let range = IdRange::new(0, 4);
        let live: HashSet<u32> = [0, 1, 2].into_iter().collect();

        assert_eq!(
            allocate_ids(range, 0, 2, &live),
            Err(IdSpaceExhausted {
                requested: 2,
                found: 1
            })
        );
        assert_eq!(allocate_ids(range, 0, 1, &live).unwrap().ids, vec![3]);
    }

    #[test]
    fn out_of_range_cursor_restarts_at_range_start() {
        let range = IdRange::new(100, 200);
        let alloc = allocate_ids(range, 7, 2, &HashSet::new()).unwrap();
        assert_eq!(alloc.ids, vec![100, 101]);
    }

    #[test]
    fn signed_ids_wrap_back_to_one() {
        assert_eq!(next_signed_pre_key_id(0), 1);
        assert_eq!(next_signed_pre_key_id(41), 42);
        assert_eq!(next_signed_pre_key_id(MAX_PRE_KEY_ID), 1);
    }

    #[test]
    fn records_survive_serialization() {
        let mut rng = rand::rng();
        let record = KeyRecord::new(42, KeyPair::generate(&mut rng));
        assert_eq!(KeyRecord::deserialize(&record.serialize()).unwrap(), record);

        let identity = IdentityKeyPair::generate(&mut rng);
        let signed_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let signed = SignedKeyRecord::generate(7, &identity, signed_at, &mut rng);
        let restored = SignedKeyRecord::deserialize(&signed.serialize()).unwrap();
        assert_eq!(restored, signed);
        assert!(restored.verify(identity.public_key()));
    }

    #[test]
    fn sub_millisecond_timestamp_round_trips() {
        let mut rng = rand::rng();
        let identity = IdentityKeyPair::generate(&mut rng);
        let signed_at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let signed = SignedKeyRecord::generate(9, &identity, signed_at, &mut rng);
        assert_eq!(signed.signed_at().timestamp_subsec_nanos(), 123_000_000);

        let restored = SignedKeyRecord::deserialize(&signed.serialize()).unwrap();
        assert_eq!(restored, signed);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let structure = PreKeyRecordStructure {
            id: Some(1),
            public_key: None,
            private_key: Some(vec![0u8; 32]),
        };
        assert!(matches!(
            KeyRecord::try_from(structure),
            Err(RecordError::MissingField("public_key"))
        ));
    }
}
