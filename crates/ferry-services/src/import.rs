//! Import runtime: the listener on the well-known port.
//!
//! One task owns the socket and dispatches every datagram by message type:
//! discovery probes are answered, transfer requests open receiver sessions,
//! chunks are reassembled and acknowledged, and closing messages tear
//! sessions down. Accept decisions arrive from outside through
//! [`ImportHandle`] without ever blocking the loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use ferry_core::config::{FerryConfig, TransferConfig};
use ferry_core::wire::MAX_DATAGRAM;
use ferry_core::{Chunk, Message, SessionId, TransferError};

use crate::discovery::{local_identity, Responder};
use crate::session::{
    new_session_table, Decision, SessionKey, SessionReport, SessionState, SessionTable,
};
use crate::storage::PayloadStore;
use crate::transport::{Datagram, SharedTransport, UdpTransport};

/// How often lingering and stalled sessions are swept.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(500);

const REJECT_REASON: &str = "rejected";

/// What the import loop tells its owner.
#[derive(Debug)]
pub enum ImportEvent {
    /// A peer wants to send; answer with [`ImportHandle::decide`].
    Offer {
        key: SessionKey,
        total_bytes: Option<u64>,
    },
    /// A second request for a session that already exists.
    Refused { key: SessionKey, error: TransferError },
    /// A session reached Completed or Aborted.
    Finished(SessionReport),
    Persisted { key: SessionKey, path: PathBuf },
    PersistFailed { key: SessionKey, error: TransferError },
}

/// Control surface for a running [`ImportServer`]. Cheap to clone.
#[derive(Clone)]
pub struct ImportHandle {
    transport: SharedTransport,
    sessions: SessionTable,
    events: mpsc::UnboundedSender<ImportEvent>,
    shutdown: broadcast::Sender<()>,
}

impl ImportHandle {
    pub fn local_addr(&self) -> Result<SocketAddr, TransferError> {
        Ok(self.transport.local_addr()?)
    }

    /// Apply the accept decision for a pending transfer. Returns false if
    /// the session is gone or no longer awaiting a decision.
    pub async fn decide(&self, key: SessionKey, decision: Decision) -> bool {
        let now = Instant::now();
        match decision {
            Decision::Accept => {
                let accepted = self
                    .sessions
                    .with_session(&key, |s| s.accept(now))
                    .unwrap_or(false);
                if accepted {
                    tracing::info!(%key, "transfer accepted");
                }
                accepted
            }
            Decision::Reject => {
                let report = self.sessions.with_session(&key, |s| {
                    if s.state() == SessionState::AwaitingAccept {
                        s.abort(REJECT_REASON, now)
                    } else {
                        None
                    }
                });
                let Some(Some(report)) = report else {
                    return false;
                };
                tracing::info!(%key, "transfer rejected");
                send_abort(&*self.transport, key, REJECT_REASON).await;
                let _ = self.events.send(ImportEvent::Finished(report));
                true
            }
        }
    }

    /// Abort a session locally. No traffic is sent to the peer.
    pub fn abort(&self, key: SessionKey, reason: &str) -> bool {
        let report = self
            .sessions
            .with_session(&key, |s| s.abort(reason, Instant::now()))
            .flatten();
        match report {
            Some(report) => {
                tracing::info!(%key, reason, "session aborted locally");
                let _ = self.events.send(ImportEvent::Finished(report));
                true
            }
            None => false,
        }
    }

    pub fn sessions(&self) -> Vec<(SessionKey, SessionState)> {
        self.sessions.snapshot()
    }

    pub fn state_of(&self, key: &SessionKey) -> Option<SessionState> {
        self.sessions.state_of(key)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// The import event loop. Build with [`ImportServer::bind`], then `run`.
pub struct ImportServer {
    transport: SharedTransport,
    sessions: SessionTable,
    responder: Responder,
    store: Arc<dyn PayloadStore>,
    transfer: TransferConfig,
    auto_accept: bool,
    events: mpsc::UnboundedSender<ImportEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl ImportServer {
    /// Bind the configured address and port.
    ///
    /// `shutdown` is shared with the rest of the process; the loop stops on
    /// the first message and [`ImportHandle::shutdown`] sends one.
    pub async fn bind(
        config: &FerryConfig,
        store: Arc<dyn PayloadStore>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<(Self, ImportHandle, mpsc::UnboundedReceiver<ImportEvent>), TransferError> {
        let addr = SocketAddr::new(config.network.bind_addr, config.network.port);
        let transport: SharedTransport = Arc::new(UdpTransport::bind(addr).await?);
        Ok(Self::with_transport(transport, config, store, shutdown))
    }

    pub fn with_transport(
        transport: SharedTransport,
        config: &FerryConfig,
        store: Arc<dyn PayloadStore>,
        shutdown: broadcast::Sender<()>,
    ) -> (Self, ImportHandle, mpsc::UnboundedReceiver<ImportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown_rx = shutdown.subscribe();
        let sessions = new_session_table();

        let handle = ImportHandle {
            transport: transport.clone(),
            sessions: sessions.clone(),
            events: events_tx.clone(),
            shutdown,
        };
        let server = Self {
            transport,
            sessions,
            responder: Responder::new(local_identity(&config.identity)),
            store,
            transfer: config.transfer.clone(),
            auto_accept: config.storage.auto_accept,
            events: events_tx,
            shutdown: shutdown_rx,
        };
        (server, handle, events_rx)
    }

    pub async fn run(mut self) -> Result<(), TransferError> {
        let local = self.transport.local_addr()?;
        tracing::info!(
            %local,
            name = %self.responder.identity().name,
            auto_accept = self.auto_accept,
            "import listener started"
        );

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    self.abort_all("shutdown");
                    tracing::info!("import listener shutting down");
                    return Ok(());
                }
                _ = housekeeping.tick() => {
                    self.housekeeping(Instant::now()).await;
                }
                result = self.transport.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.dispatch(&buf[..len], from).await,
                        Err(e) => tracing::warn!(error = %e, "receive failed"),
                    }
                }
            }
        }
    }

    async fn dispatch(&self, bytes: &[u8], from: SocketAddr) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(%from, error = %e, len = bytes.len(), "discarding malformed datagram");
                return;
            }
        };

        match message {
            Message::Discover => {
                if let Err(e) = self.responder.answer(&*self.transport, from).await {
                    tracing::warn!(%from, error = %e, "failed to answer discovery probe");
                }
            }
            Message::DataStart {
                session_id,
                total_bytes,
            } => {
                let key = SessionKey::new(from, session_id.unwrap_or(SessionId::LEGACY));
                self.handle_data_start(key, total_bytes).await;
            }
            Message::Chunk { session_id, chunk } => {
                self.handle_chunk(SessionKey::new(from, session_id), chunk).await;
            }
            Message::DataEnd { session_id, reason } => {
                self.handle_data_end(SessionKey::new(from, session_id), &reason);
            }
            Message::Abort { session_id, reason } => {
                self.handle_abort(SessionKey::new(from, session_id), &reason);
            }
            other @ (Message::DiscoverReply(_) | Message::Ack { .. }) => {
                tracing::trace!(%from, kind = other.kind(), "ignoring sender-side message");
            }
        }
    }

    async fn handle_data_start(&self, key: SessionKey, total_bytes: Option<u64>) {
        let now = Instant::now();
        if let Err(error) = self
            .sessions
            .start_receiver(key, total_bytes, self.transfer.window, now)
        {
            // A sender still asking after we aborted never heard the ABORT.
            let aborted = self
                .sessions
                .with_session(&key, |s| {
                    (s.state() == SessionState::Aborted).then(|| s.reason().to_string())
                })
                .flatten();
            match aborted {
                Some(reason) => {
                    tracing::debug!(%key, %reason, "repeating abort for retried request");
                    send_abort(&*self.transport, key, &reason).await;
                }
                None => tracing::debug!(%key, "duplicate transfer request ignored"),
            }
            let _ = self.events.send(ImportEvent::Refused { key, error });
            return;
        }

        tracing::info!(%key, ?total_bytes, "incoming transfer request");

        if self.auto_accept {
            self.sessions.with_session(&key, |s| s.accept(now));
            tracing::info!(%key, "transfer auto-accepted");
        } else {
            let _ = self.events.send(ImportEvent::Offer { key, total_bytes });
        }
    }

    async fn handle_chunk(&self, key: SessionKey, chunk: Chunk) {
        let now = Instant::now();
        let sequence = chunk.sequence;
        let Some(step) = self.sessions.with_session(&key, |s| s.on_chunk(chunk, now)) else {
            tracing::trace!(%key, sequence, "chunk for unknown session dropped");
            return;
        };

        if let Some(ack) = step.ack {
            let frame = Message::Ack {
                session_id: key.session_id,
                sequence: ack,
            }
            .encode();
            if let Err(e) = self.transport.send(key.peer, &frame).await {
                tracing::warn!(%key, error = %e, "failed to send ack");
            }
        }

        if let Some((payload, report)) = step.completed {
            tracing::info!(
                %key,
                bytes = report.bytes,
                chunks = report.chunks,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "transfer complete"
            );
            let _ = self.events.send(ImportEvent::Finished(report));
            self.persist(key, payload);
        }
    }

    /// Write the payload on the blocking pool so the loop keeps serving.
    fn persist(&self, key: SessionKey, payload: Bytes) {
        let store = self.store.clone();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let event = match store.persist(&key, &payload) {
                Ok(path) => ImportEvent::Persisted { key, path },
                Err(error) => {
                    tracing::error!(%key, error = %error, "failed to persist payload");
                    ImportEvent::PersistFailed { key, error }
                }
            };
            let _ = events.send(event);
        });
    }

    fn handle_data_end(&self, key: SessionKey, reason: &str) {
        match self.sessions.state_of(&key) {
            // Left to linger so late retries still hit the duplicate check.
            Some(state) if state.is_terminal() => {
                tracing::debug!(%key, reason, "sender closed session");
            }
            Some(_) => {
                let why = format!("sender ended transfer early: {reason}");
                self.abort_session(key, &why);
            }
            None => tracing::trace!(%key, "end for unknown session"),
        }
    }

    fn handle_abort(&self, key: SessionKey, reason: &str) {
        let why = if reason.is_empty() {
            "aborted by sender".to_string()
        } else {
            format!("aborted by sender: {reason}")
        };
        self.abort_session(key, &why);
    }

    fn abort_session(&self, key: SessionKey, reason: &str) {
        let report = self
            .sessions
            .with_session(&key, |s| s.abort(reason, Instant::now()))
            .flatten();
        if let Some(report) = report {
            tracing::info!(%key, reason, "transfer aborted");
            let _ = self.events.send(ImportEvent::Finished(report));
        }
    }

    /// Expire lingering sessions and time out stalled ones.
    async fn housekeeping(&self, now: Instant) {
        let linger = self.transfer.linger();
        self.sessions
            .retain(|s| !(s.state().is_terminal() && s.lingered(now, linger)));

        let transfer = &self.transfer;
        let timed_out = self.sessions.sweep(|s| {
            let reason = s.timeout_reason(now, transfer)?;
            let was_pending = s.state() == SessionState::AwaitingAccept;
            s.abort(reason, now).map(|report| (report, was_pending))
        });

        for (report, was_pending) in timed_out {
            tracing::info!(key = %report.key, reason = %report.reason, "session timed out");
            // A sender still waiting on a decision is told; a silent one is not.
            if was_pending {
                send_abort(&*self.transport, report.key, &report.reason).await;
            }
            let _ = self.events.send(ImportEvent::Finished(report));
        }
    }

    fn abort_all(&self, reason: &str) {
        let now = Instant::now();
        let reports = self.sessions.sweep(|s| s.abort(reason, now));
        self.sessions.clear();
        for report in reports {
            tracing::info!(key = %report.key, reason, "session aborted");
            let _ = self.events.send(ImportEvent::Finished(report));
        }
    }
}

async fn send_abort(transport: &dyn Datagram, key: SessionKey, reason: &str) {
    let frame = Message::Abort {
        session_id: key.session_id,
        reason: reason.to_string(),
    }
    .encode();
    if let Err(e) = transport.send(key.peer, &frame).await {
        tracing::warn!(%key, error = %e, "failed to send abort");
    }
}
