//! The directory loop: the single owner of the registry, the command table
//! and the discovery sync. Every control request and discovery event is
//! handled here to completion before the next one is looked at.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use shared::protocol::{Request, Response};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::command::CommandTable;
use crate::control::ControlRequest;
use crate::discovery::{DiscoveryEvent, DiscoverySync, SyncError};
use crate::registry::{ServiceEntry, ServiceRegistry};

pub struct Directory {
    registry: ServiceRegistry,
    commands: CommandTable,
    sync: DiscoverySync,
    dump_path: PathBuf,
}

impl Directory {
    pub fn new(
        registry: ServiceRegistry,
        commands: CommandTable,
        sync: DiscoverySync,
        dump_path: PathBuf,
    ) -> Self {
        Self {
            registry,
            commands,
            sync,
            dump_path,
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Dispatches one request and mirrors whatever it changed.
    pub fn execute(&mut self, request: Request) -> Response {
        let outcome = self
            .commands
            .dispatch(&mut self.registry, &request.command, &request.params);
        self.sync.reconcile(&mut self.registry);
        Response {
            id: request.id,
            outcome,
        }
    }

    pub fn on_discovery_event(&mut self, event: DiscoveryEvent) -> Result<(), SyncError> {
        self.sync.handle_event(&mut self.registry, event)
    }

    /// Expires records past their lifetime and retries failed publications.
    pub fn sweep(&mut self) {
        let expired = self.registry.expire(Utc::now());
        if expired > 0 {
            tracing::info!("Expired {} services", expired);
        }
        self.sync.reconcile(&mut self.registry);
    }

    /// Writes every known entry to the dump file as JSON.
    pub fn dump(&self) -> Result<usize> {
        let entries: Vec<&ServiceEntry> = self.registry.entries().collect();
        let json = serde_json::to_string_pretty(&entries).context("Failed to serialize services")?;

        if let Some(parent) = self.dump_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.dump_path, json)
            .with_context(|| format!("Failed to write {}", self.dump_path.display()))?;
        Ok(entries.len())
    }

    pub fn shutdown(&mut self) {
        self.sync.shutdown(&mut self.registry);
    }
}

pub async fn serve(
    mut directory: Directory,
    mut requests: mpsc::Receiver<ControlRequest>,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    sweep_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut sweep = interval_at(Instant::now() + sweep_interval, sweep_interval);
    let mut dump_signal =
        signal(SignalKind::user_defined1()).context("Failed to listen for SIGUSR1")?;

    let result = loop {
        tokio::select! {
            Some(ControlRequest { request, reply }) = requests.recv() => {
                let response = directory.execute(request);
                if reply.send(response).is_err() {
                    tracing::debug!("Control client went away before the reply");
                }
            }

            Some(event) = events.recv() => {
                if let Err(e) = directory.on_discovery_event(event) {
                    tracing::error!("{}", e);
                    break Err(anyhow::Error::new(e));
                }
            }

            _ = sweep.tick() => directory.sweep(),

            _ = dump_signal.recv() => {
                match directory.dump() {
                    Ok(count) => tracing::info!("Dumped {} services to {}", count, directory.dump_path.display()),
                    Err(e) => tracing::error!("Dump failed: {:#}", e),
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!(
                    "Directory loop shutting down with {} services",
                    directory.registry().len()
                );
                break Ok(());
            }
        }
    };

    directory.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use shared::codec::{Map, Value};
    use shared::types::{ServiceId, ServiceRecord};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    use super::*;
    use crate::control::{self, DirectoryHandle};
    use crate::discovery::{
        DiscoveryState, DiscoveryTransport, Failure, Publication, TransportFactory,
    };
    use crate::registry::signer::KeyringSigner;
    use crate::registry::RecordDefaults;

    type Published = Rc<RefCell<Vec<String>>>;

    struct RecordingTransport(Published);

    impl DiscoveryTransport for RecordingTransport {
        fn host_name(&self) -> &str {
            "node"
        }

        fn set_host_name(&mut self, _: &str) -> Result<()> {
            Ok(())
        }

        fn publish(&mut self, id: &ServiceId, _: &ServiceRecord) -> Result<Publication> {
            let fullname = format!("{}._meshdir._tcp.local.", id);
            self.0.borrow_mut().push(fullname.clone());
            Ok(Publication { fullname })
        }

        fn withdraw(&mut self, publication: &Publication) -> Result<()> {
            self.0.borrow_mut().retain(|name| *name != publication.fullname);
            Ok(())
        }

        fn browse_types(&mut self) -> Result<()> {
            Ok(())
        }

        fn resolve_instances(&mut self, _: &str) -> Result<()> {
            Ok(())
        }

        fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingFactory(Published);

    impl TransportFactory for RecordingFactory {
        fn connect(
            &mut self,
            events: mpsc::UnboundedSender<DiscoveryEvent>,
        ) -> Result<Box<dyn DiscoveryTransport>> {
            let _ = events.send(DiscoveryEvent::State(DiscoveryState::Running));
            Ok(Box::new(RecordingTransport(self.0.clone())))
        }
    }

    fn directory(
        published: &Published,
        dump_path: PathBuf,
    ) -> (
        Directory,
        mpsc::UnboundedSender<DiscoveryEvent>,
        mpsc::UnboundedReceiver<DiscoveryEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sync =
            DiscoverySync::start(Box::new(RecordingFactory(published.clone())), tx.clone()).unwrap();
        let registry = ServiceRegistry::new(
            Box::new(KeyringSigner::new()),
            RecordDefaults {
                ttl: 5,
                lifetime: 0,
            },
        );
        let directory = Directory::new(
            registry,
            CommandTable::standard().unwrap(),
            sync,
            dump_path,
        );
        (directory, tx, rx)
    }

    fn commit_request(id: u32) -> Request {
        let mut service = Map::new();
        service.insert("name", "Mesh Chat");
        service.insert("description", "chat app");
        service.insert("uri", "http://10.0.0.1:8080");
        service.insert("icon", "chat.png");
        Request::new(id, "commit_service", vec![Value::Map(service)])
    }

    #[test]
    fn test_commit_is_published_once_running() {
        let published = Published::default();
        let dir = tempfile::tempdir().unwrap();
        let (mut directory, _, mut events) = directory(&published, dir.path().join("dump.json"));

        let response = directory.execute(commit_request(1));
        assert_eq!(response.id, 1);
        assert!(response.outcome.is_ok());
        assert!(published.borrow().is_empty());

        while let Ok(event) = events.try_recv() {
            directory.on_discovery_event(event).unwrap();
        }
        assert_eq!(published.borrow().len(), 1);
        assert!(directory.registry().entries().all(|entry| entry.uptodate));
    }

    #[test]
    fn test_dump_writes_every_entry() {
        let published = Published::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("services.json");
        let (mut directory, _, _events) = directory(&published, path.clone());

        directory.execute(commit_request(1));
        directory.execute(commit_request(2));
        assert_eq!(directory.dump().unwrap(), 2);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["origin"], "local");
        assert_eq!(entries[0]["name"], "Mesh Chat");
        assert_eq!(entries[0]["resolved"], true);
    }

    #[tokio::test]
    async fn test_fatal_discovery_failure_stops_the_loop() {
        let published = Published::default();
        let dir = tempfile::tempdir().unwrap();
        let (directory, sender, events) = directory(&published, dir.path().join("dump.json"));
        let (_handle, requests) = DirectoryHandle::channel(8);
        let cancel = CancellationToken::new();
        sender
            .send(DiscoveryEvent::State(DiscoveryState::Failure(Failure::Fatal(
                "daemon died".to_string(),
            ))))
            .unwrap();

        let result = serve(directory, requests, events, Duration::from_secs(3600), cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_requests_over_the_control_socket() {
        let published = Published::default();
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("meshdird.sock");
        let (directory, _, events) = directory(&published, dir.path().join("dump.json"));

        let (handle, requests) = DirectoryHandle::channel(8);
        let cancel = CancellationToken::new();
        let listener = control::bind(&socket).unwrap();
        tokio::spawn(control::run(listener, handle, cancel.clone()));

        let client = async {
            let mut stream = UnixStream::connect(&socket).await.unwrap();
            let mut buf = vec![0u8; 2048];

            stream
                .write_all(&commit_request(1).encode().unwrap())
                .await
                .unwrap();
            let n = stream.read(&mut buf).await.unwrap();
            let committed = Response::decode(&buf[..n]).unwrap();
            assert_eq!(committed.id, 1);
            let result = committed.outcome.unwrap();
            assert_eq!(result.get("success"), Some(&Value::Bool(true)));

            let list = Request::new(2, "list_services", vec![]);
            stream.write_all(&list.encode().unwrap()).await.unwrap();
            let n = stream.read(&mut buf).await.unwrap();
            let listing = Response::decode(&buf[..n]).unwrap().outcome.unwrap();
            assert_eq!(
                listing.get("services").and_then(Value::as_list).map(<[Value]>::len),
                Some(1)
            );

            let unknown = Request::new(3, "frobnicate", vec![]);
            stream.write_all(&unknown.encode().unwrap()).await.unwrap();
            let n = stream.read(&mut buf).await.unwrap();
            assert!(Response::decode(&buf[..n]).unwrap().outcome.is_err());

            cancel.cancel();
        };

        let (result, ()) = tokio::join!(
            serve(directory, requests, events, Duration::from_secs(3600), cancel.clone()),
            client
        );
        result.unwrap();
        assert!(published.borrow().is_empty());
    }
}
