//! Identity and signing for locally published records.
//!
//! The keyring keeps one secret per identity for the lifetime of the daemon.
//! Fingerprints and signatures are SHA-256 digests over that secret.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use shared::types::{Fingerprint, ServiceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("no signing identity for key {0}")]
    UnknownIdentity(Fingerprint),
}

/// Key and signature produced for a committed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signed {
    pub key: Fingerprint,
    pub signature: String,
}

pub trait Signer {
    /// Service id for records published under `key`.
    fn derive_uuid(&self, key: &Fingerprint) -> ServiceId {
        key.derive_uuid()
    }

    /// Signs `payload` with the identity behind `key`, creating a new
    /// identity when `key` is `None`.
    fn sign(&mut self, payload: &[u8], key: Option<&Fingerprint>) -> Result<Signed, SignError>;

    /// Drops the identity behind `key` once no record uses it.
    fn forget(&mut self, key: &Fingerprint);
}

#[derive(Default)]
pub struct KeyringSigner {
    identities: HashMap<Fingerprint, [u8; 32]>,
}

impl KeyringSigner {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    fn create_identity(&mut self) -> Fingerprint {
        loop {
            let secret: [u8; 32] = rand::random();
            let digest: [u8; 32] = Sha256::digest(secret).into();
            let key = Fingerprint::from_bytes(&digest);
            if !self.identities.contains_key(&key) {
                self.identities.insert(key.clone(), secret);
                tracing::debug!("Created signing identity {}", key);
                return key;
            }
        }
    }
}

impl Signer for KeyringSigner {
    fn sign(&mut self, payload: &[u8], key: Option<&Fingerprint>) -> Result<Signed, SignError> {
        let key = match key {
            Some(key) => key.clone(),
            None => self.create_identity(),
        };
        let secret = self
            .identities
            .get(&key)
            .ok_or_else(|| SignError::UnknownIdentity(key.clone()))?;

        let mut hasher = Sha256::new();
        hasher.update(secret);
        hasher.update(payload);
        let signature = hex::encode(hasher.finalize());

        Ok(Signed { key, signature })
    }

    fn forget(&mut self, key: &Fingerprint) {
        if self.identities.remove(key).is_some() {
            tracing::debug!("Dropped signing identity {}", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::FINGERPRINT_LEN;

    #[test]
    fn test_new_identity_has_valid_fingerprint() {
        let mut signer = KeyringSigner::new();
        let signed = signer.sign(b"payload", None).unwrap();
        assert_eq!(signed.key.as_str().len(), FINGERPRINT_LEN);
        assert!(Fingerprint::parse(signed.key.as_str()).is_ok());
        assert_eq!(signed.signature.len(), 64);
    }

    #[test]
    fn test_signature_depends_on_payload_and_identity() {
        let mut signer = KeyringSigner::new();
        let first = signer.sign(b"payload", None).unwrap();
        let again = signer.sign(b"payload", Some(&first.key)).unwrap();
        assert_eq!(first, again);

        let changed = signer.sign(b"other", Some(&first.key)).unwrap();
        assert_ne!(first.signature, changed.signature);

        let second = signer.sign(b"payload", None).unwrap();
        assert_ne!(first.key, second.key);
        assert_ne!(first.signature, second.signature);
    }

    #[test]
    fn test_forgotten_identity_can_no_longer_sign() {
        let mut signer = KeyringSigner::new();
        let signed = signer.sign(b"payload", None).unwrap();
        assert_eq!(signer.len(), 1);

        signer.forget(&signed.key);
        assert!(signer.is_empty());
        assert!(signer.sign(b"payload", Some(&signed.key)).is_err());
    }

    #[test]
    fn test_unknown_identity_fails() {
        let mut signer = KeyringSigner::new();
        let stranger = Fingerprint::parse(&"ab".repeat(32)).unwrap();
        assert!(matches!(
            signer.sign(b"payload", Some(&stranger)),
            Err(SignError::UnknownIdentity(_))
        ));
    }
}
