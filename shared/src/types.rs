use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{self, CodecError, Map, Value};

/// Length of a hex-encoded identity fingerprint
pub const FINGERPRINT_LEN: usize = 64;

/// Length of the textual form of a [`ServiceId`]
pub const UUID_LEN: usize = 36;

/// Namespace for deriving service ids from fingerprints
const SERVICE_NAMESPACE: Uuid = Uuid::from_u128(0x6d65_7368_6469_5b00_8a1e_2c4f_0b9d_3e71);

/// Stable identifier of a service, derived from its fingerprint.
pub type ServiceId = Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid fingerprint: expected {FINGERPRINT_LEN} hex characters")]
pub struct InvalidFingerprint;

/// Hex fingerprint of a publishing identity, normalised to lower case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn parse(s: &str) -> Result<Self, InvalidFingerprint> {
        if s.len() != FINGERPRINT_LEN || hex::decode(s).is_err() {
            return Err(InvalidFingerprint);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn from_bytes(bytes: &[u8; FINGERPRINT_LEN / 2]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Service id for records published under this identity.
    pub fn derive_uuid(&self) -> ServiceId {
        Uuid::new_v5(&SERVICE_NAMESPACE, self.0.as_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = InvalidFingerprint;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// One advertised or discovered service.
/// This is the record shape shared by the daemon, the wire map and the dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub description: String,
    pub uri: String,
    /// Icon identifier or URI
    pub icon: String,
    /// Record format version
    pub version: String,
    /// Discovery-record time-to-live
    pub ttl: u8,
    /// Application-level expiry in seconds, 0 for none
    pub lifetime: u32,
    pub categories: Vec<String>,
    pub key: Option<Fingerprint>,
    pub uuid: Option<ServiceId>,
    pub signature: Option<String>,
}

impl ServiceRecord {
    /// Empty record carrying only defaults.
    pub fn with_defaults(version: &str, ttl: u8, lifetime: u32) -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            uri: String::new(),
            icon: String::new(),
            version: version.to_string(),
            ttl,
            lifetime,
            categories: Vec::new(),
            key: None,
            uuid: None,
            signature: None,
        }
    }

    /// Wire map shape used by `list_services`.
    pub fn to_map(&self) -> Map {
        let mut map = Map::new();
        map.insert("name", self.name.as_str());
        map.insert("description", self.description.as_str());
        map.insert("uri", self.uri.as_str());
        map.insert("icon", self.icon.as_str());
        map.insert("ttl", self.ttl);
        map.insert("lifetime", self.lifetime);
        map.insert("key", self.key.as_ref().map(Fingerprint::as_str));
        map.insert("uuid", self.uuid.map(|id| id.to_string()));
        map.insert("signature", self.signature.as_deref());
        map.insert("version", self.version.as_str());
        map.insert(
            "categories",
            self.categories
                .iter()
                .map(|c| Value::from(c.as_str()))
                .collect::<Vec<_>>(),
        );
        map
    }

    /// Canonical encoding of the signed fields.
    pub fn signing_payload(&self) -> Result<Vec<u8>, CodecError> {
        let mut fields = Map::new();
        fields.insert("name", self.name.as_str());
        fields.insert("description", self.description.as_str());
        fields.insert("uri", self.uri.as_str());
        fields.insert("icon", self.icon.as_str());
        fields.insert("version", self.version.as_str());
        fields.insert("ttl", self.ttl);
        fields.insert("lifetime", self.lifetime);
        fields.insert(
            "categories",
            self.categories
                .iter()
                .map(|c| Value::from(c.as_str()))
                .collect::<Vec<_>>(),
        );
        codec::encode(&[Value::Map(fields)])
    }
}
