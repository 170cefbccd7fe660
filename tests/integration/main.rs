//! Ferry integration test harness.
//!
//! Every test runs a real import listener and a real exporter over loopback
//! UDP. Loss, duplication, and silence are injected by wrapping a socket in
//! [`fault::FaultyTransport`] rather than by touching the host network, so
//! the suite needs no privileges and tests never share ports.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use ferry_core::config::FerryConfig;
use ferry_core::TransferError;
use ferry_services::{
    Exporter, ImportEvent, ImportHandle, ImportServer, PayloadStore, SessionKey, SessionReport,
    SharedTransport, UdpTransport,
};

mod fault;
mod transfers;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Fast timers so loss recovery and timeouts finish in well under a second.
pub fn test_config() -> FerryConfig {
    let mut config = FerryConfig::default();
    config.identity.name = "ferry-test".into();
    config.identity.addresses = vec!["127.0.0.1".parse().unwrap()];
    config.network.bind_addr = "127.0.0.1".parse().unwrap();
    config.network.port = 0;
    config.network.discovery_timeout_ms = 500;
    config.transfer.retransmit_ms = 50;
    config.transfer.max_retries = 10;
    config.transfer.linger_secs = 1;
    config.storage.auto_accept = true;
    config
}

/// Deterministic, non-repeating-looking test data.
pub fn payload(len: usize) -> Bytes {
    (0..len)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
        .collect::<Vec<u8>>()
        .into()
}

/// In-memory store: an optional export source plus every persisted import.
#[derive(Default)]
pub struct MemoryStore {
    source: Option<Bytes>,
    saved: Mutex<Vec<(SessionKey, Vec<u8>)>>,
}

impl MemoryStore {
    pub fn with_source(source: Bytes) -> Self {
        Self {
            source: Some(source),
            saved: Mutex::default(),
        }
    }

    pub fn saved(&self) -> Vec<(SessionKey, Vec<u8>)> {
        self.saved.lock().unwrap().clone()
    }
}

impl PayloadStore for MemoryStore {
    fn load(&self) -> Result<Bytes, TransferError> {
        self.source
            .clone()
            .ok_or_else(|| TransferError::SourceNotFound(PathBuf::from("memory://source")))
    }

    fn persist(&self, key: &SessionKey, payload: &[u8]) -> Result<PathBuf, TransferError> {
        self.saved.lock().unwrap().push((*key, payload.to_vec()));
        Ok(PathBuf::from(format!("memory://{}", key.session_id)))
    }
}

pub struct Importer {
    pub handle: ImportHandle,
    pub events: mpsc::UnboundedReceiver<ImportEvent>,
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
}

impl Importer {
    pub async fn next_event(&mut self) -> Result<ImportEvent> {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .context("no import event within 5s")?
            .context("import event channel closed")
    }

    /// Skip events until a transfer offer shows up.
    pub async fn next_offer(&mut self) -> Result<SessionKey> {
        loop {
            if let ImportEvent::Offer { key, .. } = self.next_event().await? {
                return Ok(key);
            }
        }
    }

    /// Skip events until `count` payloads have been persisted.
    pub async fn wait_persisted(&mut self, count: usize) -> Result<Vec<SessionReport>> {
        let mut finished = Vec::new();
        let mut persisted = 0;
        while persisted < count {
            match self.next_event().await? {
                ImportEvent::Finished(report) => finished.push(report),
                ImportEvent::Persisted { .. } => persisted += 1,
                ImportEvent::PersistFailed { error, .. } => bail!("persist failed: {error}"),
                _ => {}
            }
        }
        Ok(finished)
    }
}

impl Drop for Importer {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

pub async fn loopback() -> Result<UdpTransport> {
    Ok(UdpTransport::bind("127.0.0.1:0".parse()?).await?)
}

/// Start an import listener on an ephemeral loopback port. `wrap` decides
/// what sits between the listener and its socket.
pub async fn start_importer(
    config: &FerryConfig,
    wrap: impl FnOnce(UdpTransport) -> SharedTransport,
) -> Result<Importer> {
    let transport = wrap(loopback().await?);
    let addr = transport.local_addr()?;
    let store = Arc::new(MemoryStore::default());
    let (shutdown, _) = broadcast::channel(1);

    let (server, handle, events) =
        ImportServer::with_transport(transport, config, store.clone(), shutdown);
    tokio::spawn(server.run());

    Ok(Importer {
        handle,
        events,
        addr,
        store,
    })
}

pub async fn exporter(
    config: &FerryConfig,
    wrap: impl FnOnce(UdpTransport) -> SharedTransport,
) -> Result<Exporter> {
    Ok(Exporter::with_transport(wrap(loopback().await?), config))
}

pub fn plain(transport: UdpTransport) -> SharedTransport {
    Arc::new(transport)
}

/// Export `data` from a fresh exporter, keeping the shutdown sender alive
/// for the duration.
pub async fn export_payload(
    exporter: &mut Exporter,
    target: SocketAddr,
    data: Bytes,
) -> Result<ferry_services::ExportOutcome, TransferError> {
    let (shutdown, rx) = broadcast::channel(1);
    let store = MemoryStore::with_source(data);
    let outcome = exporter.export(target, &store, rx).await;
    drop(shutdown);
    outcome
}
