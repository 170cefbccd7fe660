//! Reliable delivery over an unreliable datagram channel.
//!
//! The sender side is a sliding window of at most `window` unacknowledged
//! chunks, each with its own retransmission deadline and retry counter.
//! The receiver side reassembles chunks strictly in sequence order,
//! buffering a bounded number of early arrivals and answering every chunk
//! with a cumulative acknowledgement.
//!
//! Both halves are plain state machines: callers pass `now` in and get
//! chunks or acknowledgements out. No I/O happens here.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use ferry_core::config::TransferConfig;
use ferry_core::Chunk;

/// Split `payload` into sequenced chunks of at most `chunk_size` bytes.
///
/// An empty payload still produces one (empty) final chunk so the receiver
/// has something to complete on.
pub fn split_payload(payload: &Bytes, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);

    if payload.is_empty() {
        return vec![Chunk {
            sequence: 0,
            payload: Bytes::new(),
            is_final: true,
        }];
    }

    let count = payload.len().div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(payload.len());
            Chunk {
                sequence: i as u32,
                payload: payload.slice(start..end),
                is_final: i + 1 == count,
            }
        })
        .collect()
}

// ── Sender ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub window: usize,
    pub retransmit_timeout: Duration,
    pub max_retries: u32,
}

impl From<&TransferConfig> for WindowConfig {
    fn from(config: &TransferConfig) -> Self {
        Self {
            window: config.window.max(1),
            retransmit_timeout: config.retransmit_timeout(),
            max_retries: config.max_retries,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    deadline: Instant,
    retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The window slid forward by `newly_acked` chunks.
    Advanced { newly_acked: u32 },
    /// Stale, duplicate, or ahead of anything sent.
    Ignored,
}

/// A chunk needed another retransmission but its budget was spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryExhausted {
    pub sequence: u32,
    pub retries: u32,
}

/// Sliding send window over a fully materialised payload.
///
/// Invariant: `in_flight` holds exactly the sequences in `base..next`.
#[derive(Debug)]
pub struct SendWindow {
    chunks: Vec<Chunk>,
    base: u32,
    next: u32,
    in_flight: BTreeMap<u32, InFlight>,
    config: WindowConfig,
    retransmissions: u64,
}

impl SendWindow {
    pub fn new(chunks: Vec<Chunk>, config: WindowConfig) -> Self {
        Self {
            chunks,
            base: 0,
            next: 0,
            in_flight: BTreeMap::new(),
            config,
            retransmissions: 0,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Lowest unacknowledged sequence.
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    pub fn is_complete(&self) -> bool {
        self.base as usize == self.chunks.len()
    }

    /// Release as many never-sent chunks as the window allows.
    pub fn fill(&mut self, now: Instant) -> Vec<Chunk> {
        let mut released = Vec::new();
        while (self.next as usize) < self.chunks.len() && self.in_flight.len() < self.config.window {
            let seq = self.next;
            self.in_flight.insert(
                seq,
                InFlight {
                    deadline: now + self.config.retransmit_timeout,
                    retries: 0,
                },
            );
            released.push(self.chunks[seq as usize].clone());
            self.next += 1;
        }
        released
    }

    /// Apply a cumulative acknowledgement of everything up to `sequence`.
    pub fn on_ack(&mut self, sequence: u32) -> AckOutcome {
        if sequence < self.base || sequence >= self.next {
            return AckOutcome::Ignored;
        }
        let newly_acked = sequence - self.base + 1;
        self.in_flight = self.in_flight.split_off(&(sequence + 1));
        self.base = sequence + 1;
        AckOutcome::Advanced { newly_acked }
    }

    /// Earliest retransmission deadline among in-flight chunks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.deadline).min()
    }

    /// Collect every in-flight chunk whose deadline has passed and re-arm it.
    ///
    /// With `charge` unset the retry counters are left alone; the sender uses
    /// this while it is still waiting for the receiver to accept.
    pub fn expire(&mut self, now: Instant, charge: bool) -> Result<Vec<Chunk>, RetryExhausted> {
        let mut resend = Vec::new();
        for (&seq, flight) in self.in_flight.iter_mut() {
            if flight.deadline > now {
                continue;
            }
            if charge {
                if flight.retries >= self.config.max_retries {
                    return Err(RetryExhausted {
                        sequence: seq,
                        retries: flight.retries,
                    });
                }
                flight.retries += 1;
            }
            flight.deadline = now + self.config.retransmit_timeout;
            resend.push(self.chunks[seq as usize].clone());
        }
        self.retransmissions += resend.len() as u64;
        Ok(resend)
    }
}

// ── Receiver ──────────────────────────────────────────────────────────────────

/// What happened to one incoming chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Appended to the payload, possibly releasing buffered successors.
    Delivered,
    /// Held until the gap before it fills.
    Buffered,
    /// Already delivered or already buffered.
    Duplicate,
    /// Outside the buffer bound or past the final chunk.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub receipt: Receipt,
    /// Highest contiguous sequence received, if any.
    pub ack: Option<u32>,
    pub complete: bool,
}

/// In-order reassembly of one payload.
#[derive(Debug)]
pub struct Reassembler {
    assembled: BytesMut,
    next_expected: u32,
    pending: BTreeMap<u32, Chunk>,
    window: usize,
    final_sequence: Option<u32>,
    complete: bool,
    delivered_chunks: u32,
}

impl Reassembler {
    /// `window` bounds how far past the next expected chunk an early
    /// arrival may be buffered.
    pub fn new(window: usize) -> Self {
        Self {
            assembled: BytesMut::new(),
            next_expected: 0,
            pending: BTreeMap::new(),
            window: window.max(1),
            final_sequence: None,
            complete: false,
            delivered_chunks: 0,
        }
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn highest_contiguous(&self) -> Option<u32> {
        self.next_expected.checked_sub(1)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn delivered_chunks(&self) -> u32 {
        self.delivered_chunks
    }

    /// Payload bytes delivered so far, in order.
    pub fn assembled(&self) -> &[u8] {
        &self.assembled
    }

    pub fn accept(&mut self, chunk: Chunk) -> ChunkReceipt {
        let receipt = self.place(chunk);
        ChunkReceipt {
            receipt,
            ack: self.highest_contiguous(),
            complete: self.complete,
        }
    }

    /// Hand over the assembled payload. Sequence tracking is kept so late
    /// duplicates are still recognised and acknowledged.
    pub fn take_payload(&mut self) -> Bytes {
        std::mem::take(&mut self.assembled).freeze()
    }

    /// Drop everything buffered or assembled.
    pub fn release(&mut self) {
        self.pending.clear();
        self.assembled = BytesMut::new();
    }

    fn place(&mut self, chunk: Chunk) -> Receipt {
        let seq = chunk.sequence;

        if self.complete || seq < self.next_expected {
            return Receipt::Duplicate;
        }
        if let Some(last) = self.final_sequence {
            if seq > last || (chunk.is_final && seq != last) {
                return Receipt::Dropped;
            }
        }

        if seq == self.next_expected {
            self.deliver(chunk);
            while let Some(next) = self.pending.remove(&self.next_expected) {
                self.deliver(next);
            }
            return Receipt::Delivered;
        }

        if (seq - self.next_expected) as usize >= self.window {
            return Receipt::Dropped;
        }
        if self.pending.contains_key(&seq) {
            return Receipt::Duplicate;
        }
        if chunk.is_final {
            self.final_sequence = Some(seq);
            self.pending.retain(|&s, _| s < seq);
        }
        self.pending.insert(seq, chunk);
        Receipt::Buffered
    }

    fn deliver(&mut self, chunk: Chunk) {
        self.assembled.extend_from_slice(&chunk.payload);
        self.next_expected += 1;
        self.delivered_chunks += 1;
        if chunk.is_final {
            self.final_sequence = Some(chunk.sequence);
            self.complete = true;
            self.pending.clear();
        }
    }
}
