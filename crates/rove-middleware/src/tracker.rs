//! Request bookkeeping for one connection.
//!
//! * [`RequestTracker`] – wrapping sequence-id allocation and the set of
//!   in-flight requests that expect a response, keyed by
//!   `(device, command, sequence id)`.
//! * [`EventIdCounter`] – lost-event detection over the device's own counter
//!   carried by unsolicited events.
//!
//! Both are plain data owned by the connection; the connection serialises
//! access behind a single mutex.

use std::collections::HashMap;

use rove_types::{EventKind, Frame, RoveError};

/// Lifecycle of a request that expects a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting in the write queue; no sequence id yet.
    Queued,
    /// Handed to the transport, write not yet acknowledged.
    Sent,
    /// Write acknowledged; waiting for the response frame.
    AwaitingResponse,
    /// Write rejected as busy; re-queued ahead of newer requests.
    Postponed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub device: u8,
    pub command: u8,
    pub sequence_id: u8,
}

impl RequestKey {
    pub fn of(frame: &Frame) -> Self {
        Self {
            device: frame.device,
            command: frame.command,
            sequence_id: frame.sequence_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub kind: EventKind,
    pub state: RequestState,
    /// Kept verbatim so a postponed request can be resent unchanged.
    pub payload: [u8; 16],
}

/// Sequence-id allocator and in-flight request table.
#[derive(Debug, Default)]
pub struct RequestTracker {
    next_sequence: u8,
    pending: HashMap<RequestKey, PendingRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence id, wrapping `255 → 0`. Ids still held by an in-flight
    /// request are skipped.
    pub fn allocate(&mut self) -> Result<u8, RoveError> {
        for _ in 0..=u8::MAX {
            let id = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            if !self.pending.keys().any(|k| k.sequence_id == id) {
                return Ok(id);
            }
        }
        Err(RoveError::SequenceExhausted)
    }

    /// Record a request that is about to be written.
    pub fn track(&mut self, key: RequestKey, kind: EventKind, payload: [u8; 16]) {
        self.pending.insert(
            key,
            PendingRequest {
                kind,
                state: RequestState::Sent,
                payload,
            },
        );
    }

    /// The transport accepted the write.
    pub fn mark_awaiting(&mut self, key: &RequestKey) {
        if let Some(req) = self.pending.get_mut(key) {
            req.state = RequestState::AwaitingResponse;
        }
    }

    /// The transport rejected the write as busy. The old id is abandoned and
    /// the request leaves the table until it is written again.
    pub fn postpone(&mut self, key: &RequestKey) -> Option<PendingRequest> {
        self.pending.remove(key).map(|mut req| {
            req.state = RequestState::Postponed;
            req
        })
    }

    /// Match an inbound response to its request, removing it.
    pub fn resolve(&mut self, response: &Frame) -> Option<PendingRequest> {
        self.pending.remove(&RequestKey::of(response))
    }

    /// Forget a request whose caller stopped waiting.
    pub fn abandon(&mut self, key: &RequestKey) -> Option<PendingRequest> {
        self.pending.remove(key)
    }

    pub fn state(&self, key: &RequestKey) -> Option<RequestState> {
        self.pending.get(key).map(|r| r.state)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lost-event detection
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks the device's 8-bit event counter.
///
/// The first event observed on a connection sets the baseline.
#[derive(Debug, Default)]
pub struct EventIdCounter {
    last: Option<u8>,
}

impl EventIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event_id`; returns how many events were skipped since the
    /// previous one, modulo 256.
    pub fn observe(&mut self, event_id: u8) -> u8 {
        let lost = match self.last {
            Some(last) => event_id.wrapping_sub(last.wrapping_add(1)),
            None => 0,
        };
        self.last = Some(event_id);
        lost
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }
}
