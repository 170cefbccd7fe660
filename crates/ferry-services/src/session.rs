//! Per-transfer state machines and the receiver session table.
//!
//! A session is keyed by (peer address, session id) so that overlapping
//! transfers from one peer stay isolated. State only moves forward:
//! Idle → AwaitingAccept → Transferring → Completed, with Aborted
//! reachable from every non-terminal state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use ferry_core::config::TransferConfig;
use ferry_core::{Chunk, Message, SessionId, TransferError};

use crate::reliability::{
    split_payload, AckOutcome, Reassembler, Receipt, RetryExhausted, SendWindow, WindowConfig,
};

// ── Identity ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: SocketAddr,
    pub session_id: SessionId,
}

impl SessionKey {
    pub fn new(peer: SocketAddr, session_id: SessionId) -> Self {
        Self { peer, session_id }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.session_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAccept,
    Transferring,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingAccept => "awaiting_accept",
            SessionState::Transferring => "transferring",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Final accounting for a session that reached a terminal state.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub key: SessionKey,
    pub role: Role,
    pub state: SessionState,
    pub reason: String,
    pub bytes: u64,
    pub chunks: u32,
    pub retransmissions: u64,
    pub elapsed: Duration,
    /// BLAKE3 of the payload, hex. Only known once the payload is whole.
    pub digest: Option<String>,
}

impl SessionReport {
    pub fn is_completed(&self) -> bool {
        self.state == SessionState::Completed
    }
}

fn digest(payload: &[u8]) -> String {
    hex::encode(blake3::hash(payload).as_bytes())
}

// ── Receiver ──────────────────────────────────────────────────────────────────

const ACCEPT_TIMED_OUT: &str = "accept decision timed out";
const PEER_SILENT: &str = "peer went silent";

/// Receiver's answer to a pending transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// Outcome of feeding one chunk to a receiver session.
#[derive(Debug, Default)]
pub struct ReceiverStep {
    /// Cumulative acknowledgement to send back, if any.
    pub ack: Option<u32>,
    /// Set exactly once, on the chunk that completed the payload.
    pub completed: Option<(Bytes, SessionReport)>,
}

#[derive(Debug)]
pub struct ReceiverSession {
    key: SessionKey,
    state: SessionState,
    reassembler: Reassembler,
    total_hint: Option<u64>,
    created_at: Instant,
    last_activity: Instant,
    finished_at: Option<Instant>,
    duplicates: u64,
    reason: String,
}

impl ReceiverSession {
    /// A freshly announced transfer, waiting for the accept decision.
    pub fn new(key: SessionKey, total_hint: Option<u64>, window: usize, now: Instant) -> Self {
        Self {
            key,
            state: SessionState::AwaitingAccept,
            reassembler: Reassembler::new(window),
            total_hint,
            created_at: now,
            last_activity: now,
            finished_at: None,
            duplicates: 0,
            reason: String::new(),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Why the session ended; empty while it is still live.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn total_hint(&self) -> Option<u64> {
        self.total_hint
    }

    /// AwaitingAccept → Transferring. False if the decision came too late.
    pub fn accept(&mut self, now: Instant) -> bool {
        if self.state != SessionState::AwaitingAccept {
            return false;
        }
        self.state = SessionState::Transferring;
        self.last_activity = now;
        true
    }

    pub fn on_chunk(&mut self, chunk: Chunk, now: Instant) -> ReceiverStep {
        match self.state {
            SessionState::Transferring | SessionState::Completed => {}
            // Not accepted yet, or already torn down: silence.
            _ => return ReceiverStep::default(),
        }

        let sequence = chunk.sequence;
        let receipt = self.reassembler.accept(chunk);
        let mut step = ReceiverStep {
            ack: receipt.ack,
            completed: None,
        };

        match receipt.receipt {
            Receipt::Duplicate => self.duplicates += 1,
            Receipt::Dropped => {
                tracing::debug!(key = %self.key, sequence, "chunk outside receive window dropped");
            }
            Receipt::Delivered | Receipt::Buffered => {}
        }

        if self.state == SessionState::Transferring {
            self.last_activity = now;
            if receipt.complete {
                self.state = SessionState::Completed;
                self.finished_at = Some(now);
                self.reason = "payload received".to_string();
                let payload = self.reassembler.take_payload();
                let mut report = self.report(now);
                report.bytes = payload.len() as u64;
                report.digest = Some(digest(&payload));
                step.completed = Some((payload, report));
            }
        }

        step
    }

    /// Move to Aborted and free buffers. None if already terminal.
    pub fn abort(&mut self, reason: impl Into<String>, now: Instant) -> Option<SessionReport> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = SessionState::Aborted;
        self.reason = reason.into();
        self.finished_at = Some(now);
        let report = self.report(now);
        self.reassembler.release();
        Some(report)
    }

    /// Terminal long enough that late duplicates no longer need answering.
    pub fn lingered(&self, now: Instant, linger: Duration) -> bool {
        self.finished_at
            .is_some_and(|at| now.saturating_duration_since(at) >= linger)
    }

    /// Why a live session should be timed out, if it should.
    pub fn timeout_reason(&self, now: Instant, config: &TransferConfig) -> Option<String> {
        match self.state {
            SessionState::AwaitingAccept
                if now.saturating_duration_since(self.created_at) >= config.accept_timeout() =>
            {
                Some(ACCEPT_TIMED_OUT.to_string())
            }
            SessionState::Transferring
                if now.saturating_duration_since(self.last_activity) >= config.idle_timeout() =>
            {
                Some(PEER_SILENT.to_string())
            }
            _ => None,
        }
    }

    pub fn report(&self, now: Instant) -> SessionReport {
        let end = self.finished_at.unwrap_or(now);
        SessionReport {
            key: self.key,
            role: Role::Receiver,
            state: self.state,
            reason: self.reason.clone(),
            bytes: self.reassembler.assembled().len() as u64,
            chunks: self.reassembler.delivered_chunks(),
            retransmissions: self.duplicates,
            elapsed: end.saturating_duration_since(self.created_at),
            digest: None,
        }
    }
}

// ── Sender ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AckProgress {
    Ignored,
    /// Window slid; these chunks may now go out.
    Advanced(Vec<Chunk>),
    /// Every chunk acknowledged.
    Completed(SessionReport),
}

#[derive(Debug)]
pub enum TimerStep {
    /// Retransmit these. `data_start` asks for the request to be repeated
    /// too, since the receiver has not acknowledged anything yet.
    Resend { data_start: bool, chunks: Vec<Chunk> },
    /// Give up; the session is now Aborted.
    Abort(SessionReport),
}

#[derive(Debug)]
pub struct SenderSession {
    key: SessionKey,
    state: SessionState,
    window: SendWindow,
    accepted: bool,
    accept_timeout: Duration,
    total_bytes: u64,
    digest: String,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    reason: String,
}

impl SenderSession {
    pub fn new(key: SessionKey, payload: Bytes, config: &TransferConfig) -> Self {
        let digest = digest(&payload);
        let total_bytes = payload.len() as u64;
        let chunks = split_payload(&payload, config.chunk_size);
        Self {
            key,
            state: SessionState::Idle,
            window: SendWindow::new(chunks, WindowConfig::from(config)),
            accepted: false,
            accept_timeout: config.accept_timeout(),
            total_bytes,
            digest,
            started_at: None,
            finished_at: None,
            reason: String::new(),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn total_chunks(&self) -> u32 {
        self.window.total_chunks()
    }

    /// The request announcing this transfer.
    pub fn data_start(&self) -> Message {
        Message::DataStart {
            session_id: Some(self.key.session_id),
            total_bytes: Some(self.total_bytes),
        }
    }

    pub fn chunk_message(&self, chunk: Chunk) -> Message {
        Message::Chunk {
            session_id: self.key.session_id,
            chunk,
        }
    }

    /// Idle → Transferring. Returns the first window of chunks.
    pub fn start(&mut self, now: Instant) -> Vec<Chunk> {
        if self.state != SessionState::Idle {
            return Vec::new();
        }
        self.state = SessionState::Transferring;
        self.started_at = Some(now);
        self.window.fill(now)
    }

    pub fn on_ack(&mut self, sequence: u32, now: Instant) -> AckProgress {
        if self.state != SessionState::Transferring {
            return AckProgress::Ignored;
        }
        match self.window.on_ack(sequence) {
            AckOutcome::Ignored => AckProgress::Ignored,
            AckOutcome::Advanced { newly_acked } => {
                if !self.accepted {
                    self.accepted = true;
                    tracing::debug!(key = %self.key, "receiver accepted transfer");
                }
                tracing::trace!(key = %self.key, sequence, newly_acked, "window advanced");
                if self.window.is_complete() {
                    self.finish(SessionState::Completed, "all chunks acknowledged", now);
                    return AckProgress::Completed(self.report(now));
                }
                AckProgress::Advanced(self.window.fill(now))
            }
        }
    }

    /// Next instant `on_timer` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != SessionState::Transferring {
            return None;
        }
        let retransmit = self.window.next_deadline();
        if self.accepted {
            return retransmit;
        }
        let accept = self.started_at.map(|at| at + self.accept_timeout);
        match (retransmit, accept) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timer(&mut self, now: Instant) -> TimerStep {
        if !self.accepted {
            let waited = self
                .started_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            if waited >= self.accept_timeout {
                let reason = format!(
                    "receiver did not accept within {}s",
                    self.accept_timeout.as_secs()
                );
                self.finish(SessionState::Aborted, reason, now);
                return TimerStep::Abort(self.report(now));
            }
        }

        match self.window.expire(now, self.accepted) {
            Ok(chunks) => TimerStep::Resend {
                data_start: !self.accepted && !chunks.is_empty(),
                chunks,
            },
            Err(RetryExhausted { sequence, retries }) => {
                let reason = format!("chunk {sequence} unacknowledged after {retries} retries");
                self.finish(SessionState::Aborted, reason, now);
                TimerStep::Abort(self.report(now))
            }
        }
    }

    /// Receiver or local caller tore the session down. None if already terminal.
    pub fn abort(&mut self, reason: impl Into<String>, now: Instant) -> Option<SessionReport> {
        if self.state.is_terminal() {
            return None;
        }
        self.finish(SessionState::Aborted, reason, now);
        Some(self.report(now))
    }

    pub fn report(&self, now: Instant) -> SessionReport {
        let end = self.finished_at.unwrap_or(now);
        let completed = self.state == SessionState::Completed;
        SessionReport {
            key: self.key,
            role: Role::Sender,
            state: self.state,
            reason: self.reason.clone(),
            bytes: if completed { self.total_bytes } else { 0 },
            chunks: self.window.base(),
            retransmissions: self.window.retransmissions(),
            elapsed: self
                .started_at
                .map(|at| end.saturating_duration_since(at))
                .unwrap_or_default(),
            digest: Some(self.digest.clone()),
        }
    }

    fn finish(&mut self, state: SessionState, reason: impl Into<String>, now: Instant) {
        self.state = state;
        self.reason = reason.into();
        self.finished_at = Some(now);
    }
}

// ── Receiver table ────────────────────────────────────────────────────────────

/// Live receiver sessions, shared between the import loop and its handle.
///
/// Closures passed to `with_session` run under a shard lock and must not
/// block or await.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<DashMap<SessionKey, ReceiverSession>>,
}

pub fn new_session_table() -> SessionTable {
    SessionTable::default()
}

impl SessionTable {
    /// Register a new receiver session. A key already present (live or
    /// lingering) is a duplicate.
    pub fn start_receiver(
        &self,
        key: SessionKey,
        total_hint: Option<u64>,
        window: usize,
        now: Instant,
    ) -> Result<(), TransferError> {
        match self.inner.entry(key) {
            Entry::Occupied(_) => Err(TransferError::DuplicateSession {
                peer: key.peer,
                session_id: key.session_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(ReceiverSession::new(key, total_hint, window, now));
                Ok(())
            }
        }
    }

    pub fn with_session<R>(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&mut ReceiverSession) -> R,
    ) -> Option<R> {
        self.inner.get_mut(key).map(|mut entry| f(entry.value_mut()))
    }

    /// Apply `f` to every session; collect whatever it yields.
    pub fn sweep<R>(&self, mut f: impl FnMut(&mut ReceiverSession) -> Option<R>) -> Vec<R> {
        self.inner
            .iter_mut()
            .filter_map(|mut entry| f(entry.value_mut()))
            .collect()
    }

    pub fn retain(&self, mut keep: impl FnMut(&ReceiverSession) -> bool) {
        self.inner.retain(|_, session| keep(session));
    }

    pub fn snapshot(&self) -> Vec<(SessionKey, SessionState)> {
        self.inner
            .iter()
            .map(|entry| (*entry.key(), entry.value().state()))
            .collect()
    }

    pub fn state_of(&self, key: &SessionKey) -> Option<SessionState> {
        self.inner.get(key).map(|entry| entry.value().state())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
