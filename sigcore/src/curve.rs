use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{self, Scalar};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret};

/// Type byte prepended to serialized Curve25519 public keys.
pub const DJB_TYPE: u8 = 0x05;
pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const PRIVATE_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// XEdDSA hash prefix: 0xFE followed by 31 bytes of 0xFF.
/// See <https://signal.org/docs/specifications/xeddsa/#xeddsa>
static XEDDSA_HASH_PREFIX: [u8; 32] = [
    0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CurveError {
    #[error("bad key type: {0:#04x}")]
    BadKeyType(u8),
    #[error("invalid key length: expected {expected}, got {got}")]
    BadKeyLength { expected: usize, got: usize },
    #[error("empty key")]
    NoKeyTypeIdentifier,
    #[error("public key does not belong to the private key")]
    KeyMismatch,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn from_djb_public_key_bytes(bytes: &[u8]) -> Result<Self, CurveError> {
        let key: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CurveError::BadKeyLength {
                expected: PUBLIC_KEY_LENGTH,
                got: bytes.len(),
            })?;
        Ok(Self(key))
    }

    /// Parses a type-prefixed key as produced by [`PublicKey::serialize`].
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CurveError> {
        let (&key_type, rest) = bytes
            .split_first()
            .ok_or(CurveError::NoKeyTypeIdentifier)?;
        if key_type != DJB_TYPE {
            return Err(CurveError::BadKeyType(key_type));
        }
        Self::from_djb_public_key_bytes(rest)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + PUBLIC_KEY_LENGTH);
        out.push(DJB_TYPE);
        out.extend_from_slice(&self.0);
        out
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    pub fn verify_signature(&self, message: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> bool {
        let mont_point = MontgomeryPoint(self.0);
        let ed_pub_key_point =
            match mont_point.to_edwards((signature[SIGNATURE_LENGTH - 1] & 0b1000_0000_u8) >> 7) {
                Some(x) => x,
                None => return false,
            };
        let cap_a = ed_pub_key_point.compress();
        let mut cap_r = [0u8; 32];
        cap_r.copy_from_slice(&signature[..32]);
        let mut s = [0u8; 32];
        s.copy_from_slice(&signature[32..]);
        s[31] &= 0b0111_1111_u8;
        if (s[31] & 0b1110_0000_u8) != 0 {
            return false;
        }
        let minus_cap_a = -ed_pub_key_point;

        let mut hash = Sha512::new();
        hash.update(&cap_r[..]);
        hash.update(cap_a.as_bytes());
        hash.update(message);
        let h = Scalar::from_hash(hash);

        let cap_r_check_point = EdwardsPoint::vartime_double_scalar_mul_basepoint(
            &h,
            &minus_cap_a,
            &Scalar::from_bytes_mod_order(s),
        );
        let cap_r_check = cap_r_check_point.compress();

        bool::from(cap_r_check.as_bytes().ct_eq(&cap_r))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    pub fn generate<R>(csprng: &mut R) -> Self
    where
        R: CryptoRng + RngCore,
    {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        csprng.fill_bytes(&mut bytes);
        Self::from(bytes)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CurveError> {
        let key: [u8; PRIVATE_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CurveError::BadKeyLength {
                expected: PRIVATE_KEY_LENGTH,
                got: bytes.len(),
            })?;
        Ok(Self::from(key))
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(*DalekPublicKey::from(&self.secret).as_bytes())
    }

    pub fn calculate_agreement(&self, their_public_key: &PublicKey) -> [u8; 32] {
        *self
            .secret
            .diffie_hellman(&DalekPublicKey::from(their_public_key.0))
            .as_bytes()
    }

    /// XEdDSA signature with the X25519 key. The Edwards sign bit travels in the
    /// top bit of the last signature byte, matching libsignal.
    pub fn calculate_signature<R>(&self, message: &[u8], csprng: &mut R) -> [u8; SIGNATURE_LENGTH]
    where
        R: CryptoRng + RngCore,
    {
        let key_data = self.secret.to_bytes();
        let a = Scalar::from_bytes_mod_order(key_data);
        let ed_public_key: CompressedEdwardsY = (&a * ED25519_BASEPOINT_TABLE).compress();
        let sign_bit = ed_public_key.as_bytes()[31] & 0b1000_0000_u8;

        let mut random_bytes = [0u8; 64];
        csprng.fill_bytes(&mut random_bytes);

        let mut hash1 = Sha512::new();
        hash1.update(&XEDDSA_HASH_PREFIX[..]);
        hash1.update(&key_data[..]);
        hash1.update(message);
        hash1.update(&random_bytes[..]);

        let r = Scalar::from_hash(hash1);
        let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();

        let mut hash = Sha512::new();
        hash.update(cap_r.as_bytes());
        hash.update(ed_public_key.as_bytes());
        hash.update(message);

        let h = Scalar::from_hash(hash);
        let s = (h * a) + r;

        let mut result = [0u8; SIGNATURE_LENGTH];
        result[..32].copy_from_slice(cap_r.as_bytes());
        result[32..].copy_from_slice(s.as_bytes());
        result[SIGNATURE_LENGTH - 1] &= 0b0111_1111_u8;
        result[SIGNATURE_LENGTH - 1] |= sign_bit;
        result
    }
}

impl From<[u8; PRIVATE_KEY_LENGTH]> for PrivateKey {
    fn from(private_key: [u8; PRIVATE_KEY_LENGTH]) -> Self {
        Self {
            secret: StaticSecret::from(scalar::clamp_integer(private_key)),
        }
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.secret.to_bytes().ct_eq(&other.secret.to_bytes()))
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

impl KeyPair {
    pub fn new(public_key: PublicKey, private_key: PrivateKey) -> Self {
        Self {
            public_key,
            private_key,
        }
    }

    pub fn generate<R>(csprng: &mut R) -> Self
    where
        R: CryptoRng + RngCore,
    {
        let private_key = PrivateKey::generate(csprng);
        Self {
            public_key: private_key.public_key(),
            private_key,
        }
    }

    /// Rebuilds a pair from stored parts, rejecting a public key that does not
    /// belong to the private key.
    pub fn from_parts(public: &[u8], private: &[u8]) -> Result<Self, CurveError> {
        let private_key = PrivateKey::deserialize(private)?;
        let public_key = if public.len() == PUBLIC_KEY_LENGTH + 1 {
            PublicKey::deserialize(public)?
        } else {
            PublicKey::from_djb_public_key_bytes(public)?
        };
        if public_key != private_key.public_key() {
            return Err(CurveError::KeyMismatch);
        }
        Ok(Self::new(public_key, private_key))
    }
}

/// The long-term identity of this device; signs signed pre-keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeyPair {
    key_pair: KeyPair,
}

impl IdentityKeyPair {
    pub fn new(key_pair: KeyPair) -> Self {
        Self { key_pair }
    }

    pub fn generate<R>(csprng: &mut R) -> Self
    where
        R: CryptoRng + RngCore,
    {
        Self::new(KeyPair::generate(csprng))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.key_pair.public_key
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.key_pair.private_key
    }

    pub fn sign<R>(&self, message: &[u8], csprng: &mut R) -> [u8; SIGNATURE_LENGTH]
    where
        R: CryptoRng + RngCore,
    {
        self.key_pair
            .private_key
            .calculate_signature(message, csprng)
    }
}
