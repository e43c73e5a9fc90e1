//! The service registry: every record this daemon knows about, local or remote.
//!
//! Local records are keyed by their derived [`ServiceId`] and are the only ones
//! commands may change. Remote records are keyed by their DNS-SD instance name
//! and are only written by discovery imports.

mod fields;
pub mod signer;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use shared::codec::{CodecError, Map};
use shared::protocol::RECORD_VERSION;
use shared::types::{Fingerprint, InvalidFingerprint, ServiceId, ServiceRecord};
use thiserror::Error;

use crate::config::RegistryConfig;
use self::fields::{validate, CommitFields};
use self::signer::{SignError, Signer};

/// Errors that fail a commit before any record is touched.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("service missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },

    #[error("invalid key: {0}")]
    InvalidKey(#[from] InvalidFingerprint),

    #[error("no service registered for key {0}")]
    UnknownService(Fingerprint),

    #[error("registered service {0} has a missing or invalid key")]
    CorruptRecord(ServiceId),
}

/// Why a commit was refused after field processing started.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("field {field} {reason}")]
    Field {
        field: &'static str,
        reason: &'static str,
    },

    #[error("failed to encode record for signing: {0}")]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("identity {0} is already registered")]
    DuplicateIdentity(ServiceId),
}

#[derive(Debug)]
pub enum CommitOutcome {
    Committed {
        id: ServiceId,
        key: Fingerprint,
        signature: String,
    },
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy)]
pub struct RecordDefaults {
    pub ttl: u8,
    pub lifetime: u32,
}

impl From<&RegistryConfig> for RecordDefaults {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            ttl: config.default_ttl,
            lifetime: config.default_lifetime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote {
        service_type: String,
        fullname: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceEntry {
    pub origin: Origin,
    #[serde(flatten)]
    pub record: ServiceRecord,
    /// Full field set is known
    pub resolved: bool,
    /// Published discovery state matches the fields
    pub uptodate: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct ServiceRegistry {
    signer: Box<dyn Signer>,
    defaults: RecordDefaults,
    local: BTreeMap<ServiceId, ServiceEntry>,
    remote: BTreeMap<String, ServiceEntry>,
}

fn expiry(now: DateTime<Utc>, lifetime: u32) -> Option<DateTime<Utc>> {
    (lifetime > 0).then(|| now + Duration::seconds(i64::from(lifetime)))
}

impl ServiceRegistry {
    pub fn new(signer: Box<dyn Signer>, defaults: RecordDefaults) -> Self {
        Self {
            signer,
            defaults,
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
        }
    }

    /// Adds a new local record, or updates the one addressed by `key`.
    pub fn commit(&mut self, fields: &Map) -> Result<CommitOutcome, CommitError> {
        let fields = CommitFields::from_map(fields)?;

        let (existing, record) = match &fields.key {
            Some(key) => {
                let id = self.signer.derive_uuid(key);
                let entry = self
                    .local
                    .get(&id)
                    .ok_or_else(|| CommitError::UnknownService(key.clone()))?;
                if entry.record.key.is_none() {
                    return Err(CommitError::CorruptRecord(id));
                }
                let mut record = entry.record.clone();
                record.signature = None;
                (Some(id), record)
            }
            None => (
                None,
                ServiceRecord::with_defaults(
                    RECORD_VERSION,
                    self.defaults.ttl,
                    self.defaults.lifetime,
                ),
            ),
        };

        match self.process(existing, record, fields) {
            Ok((id, record)) => {
                let key = record.key.clone().ok_or(CommitError::CorruptRecord(id))?;
                let signature = record.signature.clone().unwrap_or_default();
                let expires_at = expiry(Utc::now(), record.lifetime);
                self.local.insert(
                    id,
                    ServiceEntry {
                        origin: Origin::Local,
                        record,
                        resolved: true,
                        uptodate: false,
                        expires_at,
                    },
                );
                tracing::info!("Committed service {}", id);
                Ok(CommitOutcome::Committed {
                    id,
                    key,
                    signature,
                })
            }
            Err(reason) => {
                if let Some(id) = existing {
                    self.destroy_local(&id);
                    tracing::warn!("Removed service {} after failed update: {}", id, reason);
                } else {
                    tracing::warn!("Rejected new service: {}", reason);
                }
                Ok(CommitOutcome::Rejected(reason))
            }
        }
    }

    fn process(
        &mut self,
        existing: Option<ServiceId>,
        mut record: ServiceRecord,
        fields: CommitFields,
    ) -> Result<(ServiceId, ServiceRecord), Rejection> {
        fields.apply(&mut record)?;
        validate(&record)?;

        let payload = record.signing_payload()?;
        let signed = self.signer.sign(&payload, record.key.as_ref())?;
        let id = self.signer.derive_uuid(&signed.key);
        if existing.is_none() && self.local.contains_key(&id) {
            return Err(Rejection::DuplicateIdentity(id));
        }

        record.key = Some(signed.key);
        record.uuid = Some(id);
        record.signature = Some(signed.signature);
        Ok((id, record))
    }

    /// Destroys the local record published under `key`. Returns its id, or
    /// `None` when nothing matched.
    pub fn remove(&mut self, key: &str) -> Result<Option<ServiceId>, InvalidFingerprint> {
        let key = Fingerprint::parse(key)?;
        let id = self.signer.derive_uuid(&key);
        let removed = self.destroy_local(&id).map(|_| id);
        if removed.is_some() {
            tracing::info!("Removed service {}", id);
        }
        Ok(removed)
    }

    /// Removes a local record together with its signing identity.
    fn destroy_local(&mut self, id: &ServiceId) -> Option<ServiceEntry> {
        let entry = self.local.remove(id)?;
        if let Some(key) = &entry.record.key {
            self.signer.forget(key);
        }
        Some(entry)
    }

    /// Every resolved record, local first.
    pub fn list(&self) -> Vec<&ServiceEntry> {
        self.entries().filter(|entry| entry.resolved).collect()
    }

    /// Stable enumeration of all entries, local first.
    pub fn entries(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.local.values().chain(self.remote.values())
    }

    pub fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    pub fn local(&self) -> impl Iterator<Item = (&ServiceId, &ServiceEntry)> {
        self.local.iter()
    }

    pub fn local_entry(&self, id: &ServiceId) -> Option<&ServiceEntry> {
        self.local.get(id)
    }

    pub fn mark_uptodate(&mut self, id: &ServiceId, uptodate: bool) {
        if let Some(entry) = self.local.get_mut(id) {
            entry.uptodate = uptodate;
        }
    }

    pub fn mark_all_stale(&mut self) {
        for entry in self.local.values_mut() {
            entry.uptodate = false;
        }
    }

    /// Records a remote instance seen on the mesh but not yet resolved.
    pub fn import_found(&mut self, service_type: &str, fullname: &str) {
        self.remote.entry(fullname.to_string()).or_insert_with(|| ServiceEntry {
            origin: Origin::Remote {
                service_type: service_type.to_string(),
                fullname: fullname.to_string(),
            },
            record: ServiceRecord::with_defaults(RECORD_VERSION, 0, 0),
            resolved: false,
            uptodate: true,
            expires_at: None,
        });
    }

    /// Stores the resolved fields of a remote instance. `complete` says
    /// whether every required field was present.
    pub fn import_resolved(
        &mut self,
        service_type: &str,
        fullname: &str,
        mut record: ServiceRecord,
        complete: bool,
        now: DateTime<Utc>,
    ) {
        record.uuid = record.key.as_ref().map(|key| self.signer.derive_uuid(key));
        if let Some(id) = record.uuid {
            if self.local.contains_key(&id) {
                tracing::debug!("Ignoring own announcement {}", fullname);
                self.remote.remove(fullname);
                return;
            }
        }

        let expires_at = expiry(now, record.lifetime);
        tracing::debug!("Imported remote service {} (resolved: {})", fullname, complete);
        self.remote.insert(
            fullname.to_string(),
            ServiceEntry {
                origin: Origin::Remote {
                    service_type: service_type.to_string(),
                    fullname: fullname.to_string(),
                },
                record,
                resolved: complete,
                uptodate: true,
                expires_at,
            },
        );
    }

    pub fn forget_remote(&mut self, fullname: &str) -> bool {
        self.remote.remove(fullname).is_some()
    }

    /// Drops every imported record, returning how many there were.
    pub fn drop_remote(&mut self) -> usize {
        let count = self.remote.len();
        self.remote.clear();
        count
    }

    /// Removes every entry whose lifetime ran out before `now`.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let live = |entry: &ServiceEntry| entry.expires_at.map_or(true, |at| at > now);
        let before = self.len();
        let expired: Vec<ServiceId> = self
            .local
            .iter()
            .filter(|(_, entry)| !live(entry))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.destroy_local(&id);
            tracing::info!("Service {} expired", id);
        }
        self.remote.retain(|_, entry| live(entry));
        before - self.len()
    }
}
