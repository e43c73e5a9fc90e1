use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use anyhow::{bail, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use mdns_sd::{DaemonEvent, ServiceDaemon, ServiceEvent, ServiceInfo};
use shared::protocol::META_QUERY_TYPE;
use shared::types::{ServiceId, ServiceRecord};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{
    txt, DiscoveryEvent, DiscoveryState, DiscoveryTransport, Failure, Publication,
    RemoteService, TransportFactory,
};
use crate::config::DiscoveryConfig;

/// What a browse receiver reports on.
#[derive(Debug, Clone)]
enum Browse {
    Types,
    Instances,
}

type RecvResult = (
    Browse,
    flume::Receiver<ServiceEvent>,
    std::result::Result<ServiceEvent, flume::RecvError>,
);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

fn make_recv_future(kind: Browse, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (kind, rx, result)
    })
}

/// Our host name and the instances we have registered under it.
#[derive(Debug, Clone)]
struct LocalIdentity {
    host: String,
    instances: HashSet<String>,
}

impl LocalIdentity {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            instances: HashSet::new(),
        }
    }

    fn server(&self) -> String {
        format!("{}.local.", self.host)
    }

    /// An instance we did not register that resolves to our host name.
    fn collides_with(&self, hostname: &str, fullname: &str) -> bool {
        !self.instances.contains(fullname) && hostname.eq_ignore_ascii_case(&self.server())
    }
}

pub struct MdnsFactory {
    service_type: String,
    host_name: String,
    interface: Option<String>,
}

impl MdnsFactory {
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        Ok(Self {
            service_type: config.service_type.clone(),
            host_name: config.resolve_host_name()?,
            interface: config.interface.clone(),
        })
    }
}

impl TransportFactory for MdnsFactory {
    fn connect(
        &mut self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<Box<dyn DiscoveryTransport>> {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
        if let Some(interface) = &self.interface {
            daemon
                .disable_interface(mdns_sd::IfKind::All)
                .context("Failed to disable default interfaces")?;
            daemon
                .enable_interface(interface.as_str())
                .with_context(|| format!("Failed to enable interface {}", interface))?;
        }
        let monitor = daemon.monitor().context("Failed to monitor mDNS daemon")?;

        let cancel = CancellationToken::new();
        let (browse_tx, browse_rx) = mpsc::unbounded_channel();
        let (identity, identity_rx) = watch::channel(LocalIdentity::new(&self.host_name));

        tokio::spawn(run_monitor(monitor, events.clone(), cancel.clone()));
        tokio::spawn(run_browser(
            browse_rx,
            identity_rx,
            events.clone(),
            cancel.clone(),
        ));

        tracing::info!("mDNS transport started as {}", self.host_name);
        let _ = events.send(DiscoveryEvent::State(DiscoveryState::Running));

        Ok(Box::new(MdnsTransport {
            daemon,
            service_type: self.service_type.clone(),
            host_name: self.host_name.clone(),
            identity,
            events,
            browse_tx,
            cancel,
        }))
    }
}

pub struct MdnsTransport {
    daemon: ServiceDaemon,
    service_type: String,
    host_name: String,
    identity: watch::Sender<LocalIdentity>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    browse_tx: mpsc::UnboundedSender<(Browse, flume::Receiver<ServiceEvent>)>,
    cancel: CancellationToken,
}

impl MdnsTransport {
    fn browse(&mut self, kind: Browse, service_type: &str) -> Result<()> {
        let receiver = self
            .daemon
            .browse(service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;
        self.browse_tx
            .send((kind, receiver))
            .context("mDNS browser task has stopped")
    }
}

impl DiscoveryTransport for MdnsTransport {
    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn set_host_name(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('.') {
            bail!("invalid host name {:?}", name);
        }
        self.host_name = name.to_string();
        self.identity.send_replace(LocalIdentity::new(name));
        Ok(())
    }

    fn publish(&mut self, id: &ServiceId, record: &ServiceRecord) -> Result<Publication> {
        let instance_name = id.to_string();
        let host = self.identity.borrow().server();
        let port = url::Url::parse(&record.uri)
            .ok()
            .and_then(|uri| uri.port_or_known_default())
            .unwrap_or(0);

        let service_info = ServiceInfo::new(
            &self.service_type,
            &instance_name,
            &host,
            "",
            port,
            txt::to_properties(record),
        )
        .context("Failed to create ServiceInfo")?
        .enable_addr_auto();

        let fullname = service_info.get_fullname().to_string();
        self.daemon
            .register(service_info)
            .context("Failed to register mDNS service")?;
        self.identity.send_modify(|identity| {
            identity.instances.insert(fullname.clone());
        });

        tracing::debug!("Registered {} on port {}", fullname, port);
        Ok(Publication { fullname })
    }

    fn withdraw(&mut self, publication: &Publication) -> Result<()> {
        self.daemon
            .unregister(&publication.fullname)
            .context("Failed to unregister mDNS service")?;
        self.identity.send_modify(|identity| {
            identity.instances.remove(&publication.fullname);
        });
        Ok(())
    }

    fn browse_types(&mut self) -> Result<()> {
        self.browse(Browse::Types, META_QUERY_TYPE)?;
        // The meta query does not always answer for our own type.
        let _ = self
            .events
            .send(DiscoveryEvent::TypeFound(self.service_type.clone()));
        Ok(())
    }

    fn resolve_instances(&mut self, service_type: &str) -> Result<()> {
        self.browse(Browse::Instances, service_type)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.daemon
            .shutdown()
            .context("Failed to shutdown mDNS daemon")?;
        Ok(())
    }
}

impl Drop for MdnsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_monitor(
    monitor: flume::Receiver<DaemonEvent>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            event = monitor.recv_async() => {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("mDNS monitor closed: {}", e);
                        let _ = events.send(DiscoveryEvent::State(DiscoveryState::Failure(
                            Failure::Disconnected,
                        )));
                        break;
                    }
                };
                let sent = daemon_states(&event)
                    .into_iter()
                    .all(|state| events.send(DiscoveryEvent::State(state)).is_ok());
                if !sent {
                    break;
                }
            }
        }
    }
}

/// States a daemon event moves the sync through.
///
/// An address change means every record is announced again, so the sync
/// passes through `Registering` to republish.
fn daemon_states(event: &DaemonEvent) -> Vec<DiscoveryState> {
    match event {
        DaemonEvent::IpAdd(addr) | DaemonEvent::IpDel(addr) => {
            tracing::info!("mDNS interface address changed: {}", addr);
            vec![DiscoveryState::Registering, DiscoveryState::Running]
        }
        DaemonEvent::Error(e) => {
            tracing::error!("mDNS daemon error: {}", e);
            Vec::new()
        }
        other => {
            tracing::debug!("mDNS daemon event: {:?}", other);
            Vec::new()
        }
    }
}

async fn run_browser(
    mut requests: mpsc::UnboundedReceiver<(Browse, flume::Receiver<ServiceEvent>)>,
    identity: watch::Receiver<LocalIdentity>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    let mut futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

    loop {
        tokio::select! {
            Some((kind, rx)) = requests.recv() => {
                futures.push(make_recv_future(kind, rx));
            }

            Some((kind, rx, result)) = futures.next() => {
                match result {
                    Ok(event) => {
                        if let (Browse::Instances, ServiceEvent::ServiceResolved(info)) = (&kind, &event) {
                            let collides = identity
                                .borrow()
                                .collides_with(info.get_hostname(), info.get_fullname());
                            if collides {
                                tracing::warn!(
                                    "{} claims our host name {}",
                                    info.get_fullname(),
                                    info.get_hostname()
                                );
                                let _ = events.send(DiscoveryEvent::State(DiscoveryState::Collision));
                                let _ = events.send(DiscoveryEvent::State(DiscoveryState::Running));
                            }
                        }
                        if let Some(event) = convert_event(&kind, event) {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        futures.push(make_recv_future(kind, rx));
                    }
                    Err(e) => {
                        tracing::warn!("mDNS {:?} receiver disconnected: {}", kind, e);
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }
}

fn convert_event(kind: &Browse, event: ServiceEvent) -> Option<DiscoveryEvent> {
    match (kind, event) {
        (Browse::Types, ServiceEvent::ServiceFound(_, service_type)) => {
            Some(DiscoveryEvent::TypeFound(service_type))
        }
        (Browse::Instances, ServiceEvent::ServiceFound(service_type, fullname)) => {
            Some(DiscoveryEvent::InstanceFound {
                service_type,
                fullname,
            })
        }
        (Browse::Instances, ServiceEvent::ServiceResolved(info)) => {
            Some(DiscoveryEvent::InstanceResolved(convert_service_info(&info)))
        }
        (Browse::Instances, ServiceEvent::ServiceRemoved(_, fullname)) => {
            Some(DiscoveryEvent::InstanceRemoved { fullname })
        }
        _ => None,
    }
}

fn convert_service_info(info: &ServiceInfo) -> RemoteService {
    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    RemoteService {
        service_type: info.get_type().to_string(),
        fullname: info.get_fullname().to_string(),
        txt,
    }
}
