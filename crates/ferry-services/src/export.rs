//! Export runtime: discover a peer, then push one payload to it.
//!
//! Each [`Exporter`] owns its own ephemeral socket, so acknowledgements for
//! an outgoing transfer never compete with the import listener for packets.
//! One transfer runs at a time per exporter.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::Instant;

use ferry_core::config::{FerryConfig, TransferConfig};
use ferry_core::wire::MAX_DATAGRAM;
use ferry_core::{Chunk, Message, PeerIdentity, SessionId, TransferError};

use crate::discovery;
use crate::session::{AckProgress, SenderSession, SessionKey, SessionReport, TimerStep};
use crate::storage::PayloadStore;
use crate::transport::{Datagram, SharedTransport, UdpTransport};

/// Result of a successful export.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub identity: PeerIdentity,
    pub report: SessionReport,
}

pub struct Exporter {
    transport: SharedTransport,
    transfer: TransferConfig,
    discovery_timeout: Duration,
}

impl Exporter {
    /// Bind an ephemeral socket of the same family as `target`.
    pub async fn bind(config: &FerryConfig, target: SocketAddr) -> Result<Self, TransferError> {
        let unspecified = match target.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let transport = UdpTransport::bind(SocketAddr::new(unspecified, 0)).await?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    pub fn with_transport(transport: SharedTransport, config: &FerryConfig) -> Self {
        Self {
            transport,
            transfer: config.transfer.clone(),
            discovery_timeout: config.network.discovery_timeout(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransferError> {
        Ok(self.transport.local_addr()?)
    }

    pub async fn discover(&mut self, target: SocketAddr) -> Result<PeerIdentity, TransferError> {
        discovery::discover(&*self.transport, target, self.discovery_timeout).await
    }

    /// Load the payload, confirm the peer is there, and send.
    pub async fn export(
        &mut self,
        target: SocketAddr,
        store: &dyn PayloadStore,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<ExportOutcome, TransferError> {
        let payload = store.load()?;
        let identity = self.discover(target).await?;
        let report = self.send(target, payload, shutdown).await?;
        Ok(ExportOutcome { identity, report })
    }

    /// Run one sender session to completion against `target`.
    pub async fn send(
        &mut self,
        target: SocketAddr,
        payload: Bytes,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<SessionReport, TransferError> {
        let key = SessionKey::new(target, SessionId::random());
        let session = SenderSession::new(key, payload, &self.transfer);
        tracing::info!(
            %key,
            chunks = session.total_chunks(),
            window = self.transfer.window,
            "starting transfer"
        );
        drive_sender(&*self.transport, session, shutdown).await
    }
}

/// Drive a sender session until it completes or aborts.
///
/// Acknowledgements are polled before the retransmission timer so that an
/// ack arriving together with a deadline advances the window first.
pub async fn drive_sender(
    transport: &dyn Datagram,
    mut session: SenderSession,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<SessionReport, TransferError> {
    let key = session.key();
    let peer = key.peer;

    if let Err(e) = transport.send(peer, &session.data_start().encode()).await {
        session.abort(format!("transport failure: {e}"), Instant::now());
        return Err(e);
    }
    let first = session.start(Instant::now());
    send_chunks(transport, &session, first).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let Some(deadline) = session.next_deadline() else {
            // Only reachable once terminal; the loop returns before that.
            return Ok(session.report(Instant::now()));
        };

        tokio::select! {
            biased;

            Ok(()) = shutdown.recv() => {
                if let Some(report) = session.abort("shutdown", Instant::now()) {
                    log_report(&report);
                }
                return Err(TransferError::Cancelled("shutdown".into()));
            }

            result = transport.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        if let Some(report) = session.abort(format!("transport failure: {e}"), Instant::now()) {
                            log_report(&report);
                        }
                        return Err(TransferError::Transport(e));
                    }
                };
                if from != peer {
                    tracing::trace!(%from, "datagram from unexpected source ignored");
                    continue;
                }
                match Message::decode(&buf[..len]) {
                    Ok(Message::Ack { session_id, sequence }) if session_id == key.session_id => {
                        match session.on_ack(sequence, Instant::now()) {
                            AckProgress::Ignored => {
                                tracing::trace!(%key, sequence, "stale ack ignored");
                            }
                            AckProgress::Advanced(chunks) => {
                                send_chunks(transport, &session, chunks).await?;
                            }
                            AckProgress::Completed(report) => {
                                let end = Message::DataEnd {
                                    session_id: key.session_id,
                                    reason: "complete".into(),
                                };
                                if let Err(e) = transport.send(peer, &end.encode()).await {
                                    tracing::debug!(%key, error = %e, "failed to send end of transfer");
                                }
                                log_report(&report);
                                return Ok(report);
                            }
                        }
                    }
                    Ok(Message::Abort { session_id, reason }) if session_id == key.session_id => {
                        let why = if reason.is_empty() { "aborted by receiver".to_string() } else { reason };
                        if let Some(report) = session.abort(why.clone(), Instant::now()) {
                            log_report(&report);
                        }
                        return Err(TransferError::Rejected { peer, reason: why });
                    }
                    Ok(other) => {
                        tracing::trace!(%key, kind = other.kind(), "ignoring unrelated message");
                    }
                    Err(e) => {
                        tracing::debug!(%key, error = %e, "discarding malformed datagram");
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                match session.on_timer(Instant::now()) {
                    TimerStep::Resend { data_start, chunks } => {
                        if !chunks.is_empty() {
                            tracing::debug!(%key, count = chunks.len(), "retransmitting");
                        }
                        if data_start {
                            transport.send(peer, &session.data_start().encode()).await?;
                        }
                        send_chunks(transport, &session, chunks).await?;
                    }
                    TimerStep::Abort(report) => {
                        let abort = Message::Abort {
                            session_id: key.session_id,
                            reason: report.reason.clone(),
                        };
                        if let Err(e) = transport.send(peer, &abort.encode()).await {
                            tracing::debug!(%key, error = %e, "failed to send abort");
                        }
                        log_report(&report);
                        return Err(TransferError::PeerUnresponsive {
                            peer,
                            reason: report.reason,
                        });
                    }
                }
            }
        }
    }
}

async fn send_chunks(
    transport: &dyn Datagram,
    session: &SenderSession,
    chunks: Vec<Chunk>,
) -> Result<(), TransferError> {
    for chunk in chunks {
        let frame = session.chunk_message(chunk).encode();
        transport.send(session.key().peer, &frame).await?;
    }
    Ok(())
}

fn log_report(report: &SessionReport) {
    if report.is_completed() {
        tracing::info!(
            key = %report.key,
            bytes = report.bytes,
            chunks = report.chunks,
            retransmissions = report.retransmissions,
            elapsed_ms = report.elapsed.as_millis() as u64,
            digest = report.digest.as_deref().unwrap_or(""),
            "transfer finished"
        );
    } else {
        tracing::warn!(
            key = %report.key,
            state = %report.state,
            reason = %report.reason,
            chunks = report.chunks,
            retransmissions = report.retransmissions,
            "transfer did not complete"
        );
    }
}
