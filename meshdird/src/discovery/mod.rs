//! Mirroring of the service registry onto the discovery transport.
//!
//! The transport reports connectivity changes and remote announcements as
//! [`DiscoveryEvent`]s on a channel drained by the directory loop, which hands
//! them to [`DiscoverySync`]. Sync in turn publishes and withdraws local
//! records through the [`DiscoveryTransport`] seam.

pub mod mdns;
mod sync;
pub mod txt;

use std::collections::HashMap;

use anyhow::Result;
use shared::types::{ServiceId, ServiceRecord};
use tokio::sync::mpsc::UnboundedSender;

pub use self::sync::{DiscoverySync, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The transport lost its connection and may be rebuilt.
    Disconnected,
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryState {
    Connecting,
    Registering,
    Running,
    Collision,
    Failure(Failure),
}

/// A remote instance whose TXT properties were resolved.
#[derive(Debug, Clone)]
pub struct RemoteService {
    pub service_type: String,
    pub fullname: String,
    pub txt: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    State(DiscoveryState),
    TypeFound(String),
    InstanceFound {
        service_type: String,
        fullname: String,
    },
    InstanceResolved(RemoteService),
    InstanceRemoved {
        fullname: String,
    },
}

/// Handle for one announced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub fullname: String,
}

pub trait DiscoveryTransport {
    fn host_name(&self) -> &str;

    fn set_host_name(&mut self, name: &str) -> Result<()>;

    fn publish(&mut self, id: &ServiceId, record: &ServiceRecord) -> Result<Publication>;

    fn withdraw(&mut self, publication: &Publication) -> Result<()>;

    /// Starts reporting every service type seen on the mesh as
    /// [`DiscoveryEvent::TypeFound`].
    fn browse_types(&mut self) -> Result<()>;

    /// Starts reporting instances of `service_type`.
    fn resolve_instances(&mut self, service_type: &str) -> Result<()>;

    fn shutdown(&mut self) -> Result<()>;
}

pub trait TransportFactory {
    /// Builds a transport that reports to `events`.
    fn connect(
        &mut self,
        events: UnboundedSender<DiscoveryEvent>,
    ) -> Result<Box<dyn DiscoveryTransport>>;
}

/// Next host name to try after a collision: `node`, `node-2`, `node-3`, ...
pub fn alternative_host_name(name: &str) -> String {
    if let Some((base, suffix)) = name.rsplit_once('-') {
        if let Ok(n) = suffix.parse::<u32>() {
            if !base.is_empty() && n >= 2 {
                if let Some(next) = n.checked_add(1) {
                    return format!("{}-{}", base, next);
                }
            }
        }
    }
    format!("{}-2", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternative_host_names() {
        assert_eq!(alternative_host_name("node"), "node-2");
        assert_eq!(alternative_host_name("node-2"), "node-3");
        assert_eq!(alternative_host_name("node-9"), "node-10");
        assert_eq!(alternative_host_name("mesh-node"), "mesh-node-2");
        assert_eq!(alternative_host_name("node-1"), "node-1-2");
        assert_eq!(alternative_host_name("node-4294967295"), "node-4294967295-2");
    }
}
