use std::collections::{BTreeMap, HashSet};

use anyhow::Context;
use chrono::Utc;
use shared::types::ServiceId;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use super::{
    alternative_host_name, txt, DiscoveryEvent, DiscoveryState, DiscoveryTransport, Failure,
    Publication, TransportFactory,
};
use crate::registry::ServiceRegistry;

/// Failures that end the daemon.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to reconnect discovery transport: {0:#}")]
    Reconnect(anyhow::Error),

    #[error("failed to switch host name to {name}: {cause:#}")]
    Rename { name: String, cause: anyhow::Error },

    #[error("discovery failed: {0}")]
    Fatal(String),
}

pub struct DiscoverySync {
    factory: Box<dyn TransportFactory>,
    events: UnboundedSender<DiscoveryEvent>,
    transport: Option<Box<dyn DiscoveryTransport>>,
    state: DiscoveryState,
    published: BTreeMap<ServiceId, Publication>,
    browsing: bool,
    resolving: HashSet<String>,
}

impl DiscoverySync {
    /// Connects the first transport. Its state reports arrive on `events`.
    pub fn start(
        mut factory: Box<dyn TransportFactory>,
        events: UnboundedSender<DiscoveryEvent>,
    ) -> anyhow::Result<Self> {
        let transport = factory
            .connect(events.clone())
            .context("Failed to create discovery transport")?;
        Ok(Self {
            factory,
            events,
            transport: Some(transport),
            state: DiscoveryState::Connecting,
            published: BTreeMap::new(),
            browsing: false,
            resolving: HashSet::new(),
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> &DiscoveryState {
        &self.state
    }

    #[cfg(test)]
    pub fn is_published(&self, id: &ServiceId) -> bool {
        self.published.contains_key(id)
    }

    pub fn handle_event(
        &mut self,
        registry: &mut ServiceRegistry,
        event: DiscoveryEvent,
    ) -> Result<(), SyncError> {
        match event {
            DiscoveryEvent::State(state) => self.transition(registry, state)?,
            DiscoveryEvent::TypeFound(service_type) => self.resolve(&service_type),
            DiscoveryEvent::InstanceFound {
                service_type,
                fullname,
            } => registry.import_found(&service_type, &fullname),
            DiscoveryEvent::InstanceResolved(remote) => {
                let (record, complete) = txt::from_properties(&remote.txt);
                registry.import_resolved(
                    &remote.service_type,
                    &remote.fullname,
                    record,
                    complete,
                    Utc::now(),
                );
            }
            DiscoveryEvent::InstanceRemoved { fullname } => {
                if registry.forget_remote(&fullname) {
                    tracing::debug!("Remote service {} went away", fullname);
                }
            }
        }
        Ok(())
    }

    fn transition(
        &mut self,
        registry: &mut ServiceRegistry,
        state: DiscoveryState,
    ) -> Result<(), SyncError> {
        tracing::debug!("Discovery state {:?} -> {:?}", self.state, state);
        match state {
            DiscoveryState::Connecting => self.enter_connecting(registry),
            DiscoveryState::Registering => self.enter_registering(registry),
            DiscoveryState::Running => self.enter_running(registry),
            DiscoveryState::Collision => self.enter_collision(registry)?,
            DiscoveryState::Failure(failure) => self.enter_failure(registry, failure)?,
        }
        Ok(())
    }

    fn enter_connecting(&mut self, registry: &mut ServiceRegistry) {
        self.state = DiscoveryState::Connecting;
        self.withdraw_all(registry);
    }

    fn enter_registering(&mut self, registry: &mut ServiceRegistry) {
        self.state = DiscoveryState::Registering;
        self.withdraw_all(registry);
    }

    fn enter_collision(&mut self, registry: &mut ServiceRegistry) -> Result<(), SyncError> {
        self.state = DiscoveryState::Collision;
        self.withdraw_all(registry);

        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        let name = alternative_host_name(transport.host_name());
        tracing::warn!("Host name {} collided, trying {}", transport.host_name(), name);
        transport
            .set_host_name(&name)
            .map_err(|cause| SyncError::Rename { name, cause })
    }

    fn enter_running(&mut self, registry: &mut ServiceRegistry) {
        self.state = DiscoveryState::Running;
        if !self.browsing {
            if let Some(transport) = self.transport.as_mut() {
                match transport.browse_types() {
                    Ok(()) => self.browsing = true,
                    Err(e) => tracing::warn!("Failed to browse service types: {:#}", e),
                }
            }
        }
        self.reconcile(registry);
    }

    fn enter_failure(
        &mut self,
        registry: &mut ServiceRegistry,
        failure: Failure,
    ) -> Result<(), SyncError> {
        self.state = DiscoveryState::Failure(failure.clone());
        self.withdraw_all(registry);

        match failure {
            Failure::Disconnected => {
                tracing::warn!("Discovery transport disconnected, reconnecting");
                self.drop_transport();
                let dropped = registry.drop_remote();
                tracing::debug!("Dropped {} remote services", dropped);

                let transport = self
                    .factory
                    .connect(self.events.clone())
                    .map_err(SyncError::Reconnect)?;
                self.transport = Some(transport);
                self.enter_connecting(registry);
                Ok(())
            }
            Failure::Fatal(reason) => Err(SyncError::Fatal(reason)),
        }
    }

    /// Withdraws every publication and leaves the records stale for the next
    /// `Running` entry.
    fn withdraw_all(&mut self, registry: &mut ServiceRegistry) {
        for (id, publication) in std::mem::take(&mut self.published) {
            self.withdraw(&id, &publication);
        }
        registry.mark_all_stale();
    }

    fn withdraw(&mut self, id: &ServiceId, publication: &Publication) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.withdraw(publication) {
            Ok(()) => tracing::debug!("Withdrew service {}", id),
            Err(e) => tracing::warn!("Failed to withdraw {}: {:#}", publication.fullname, e),
        }
    }

    /// Brings the announcements in line with the registry.
    pub fn reconcile(&mut self, registry: &mut ServiceRegistry) {
        let outdated: Vec<ServiceId> = self
            .published
            .keys()
            .filter(|id| registry.local_entry(id).map_or(true, |entry| !entry.uptodate))
            .copied()
            .collect();
        for id in outdated {
            if let Some(publication) = self.published.remove(&id) {
                self.withdraw(&id, &publication);
            }
        }

        if self.state != DiscoveryState::Running {
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        let pending: Vec<ServiceId> = registry
            .local()
            .filter(|(id, entry)| !entry.uptodate || !self.published.contains_key(*id))
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            let Some(entry) = registry.local_entry(&id) else {
                continue;
            };
            match transport.publish(&id, &entry.record) {
                Ok(publication) => {
                    tracing::info!("Published service {} as {}", id, publication.fullname);
                    self.published.insert(id, publication);
                    registry.mark_uptodate(&id, true);
                }
                Err(e) => {
                    tracing::warn!("Failed to publish service {}: {:#}", id, e);
                    registry.mark_uptodate(&id, false);
                }
            }
        }
    }

    fn resolve(&mut self, service_type: &str) {
        if self.resolving.contains(service_type) {
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.resolve_instances(service_type) {
            Ok(()) => {
                tracing::info!("Browsing instances of {}", service_type);
                self.resolving.insert(service_type.to_string());
            }
            Err(e) => tracing::warn!("Failed to browse {}: {:#}", service_type, e),
        }
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.shutdown() {
                tracing::warn!("Failed to shut down discovery transport: {:#}", e);
            }
        }
        self.browsing = false;
        self.resolving.clear();
    }

    /// Withdraws everything and releases the transport.
    pub fn shutdown(&mut self, registry: &mut ServiceRegistry) {
        self.withdraw_all(registry);
        self.drop_transport();
    }
}
