//! Event router: classifies inbound frames and fans them out to subscribers.
//!
//! Two subscriber flavours share one ordered table:
//!
//! | Flavour | Obtained via | Lifetime |
//! |---|---|---|
//! | one-shot | [`EventRouter::subscribe_once`] | removed atomically with the first matching frame |
//! | persistent | [`EventRouter::subscribe`] | until the [`Subscription`] is dropped |
//!
//! Dispatch visits subscribers in insertion order and never blocks: one-shot
//! subscribers are fed through `oneshot` channels and persistent ones through
//! unbounded `mpsc` channels.
//!
//! Link anomalies are logged and published on a separate broadcast channel
//! of [`Diagnostic`] values (see [`EventRouter::diagnostics`]).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rove_types::{Diagnostic, EventKind, Frame, LinkNotice, RoveError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

/// Buffered diagnostics before slow readers start lagging.
const DIAGNOSTIC_CAPACITY: usize = 64;

enum Sink {
    Once(oneshot::Sender<Frame>),
    Stream(mpsc::UnboundedSender<Frame>),
}

struct Subscriber {
    id: u64,
    kind: EventKind,
    /// One-shot subscribers may only accept a specific sequence id.
    sequence_id: Option<u8>,
    sink: Sink,
}

#[derive(Default)]
struct RouterState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

/// Shared router. Clones share the same subscriber table.
#[derive(Clone)]
pub struct EventRouter {
    state: Arc<Mutex<RouterState>>,
    diagnostics: broadcast::Sender<Diagnostic>,
}

impl EventRouter {
    pub fn new() -> Self {
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(RouterState::default())),
            diagnostics,
        }
    }

    /// Name the frame by its `(device, command)` pair.
    pub fn classify(&self, frame: &Frame) -> EventKind {
        EventKind::classify(frame.device, frame.command)
    }

    /// Deliver `frame` to every subscriber of `kind`, in insertion order.
    ///
    /// Returns the number of subscribers that were handed the frame.
    pub fn dispatch(&self, kind: EventKind, frame: &Frame) -> usize {
        let mut state = lock(&self.state);
        let mut delivered = 0;
        // A frame resolves at most one one-shot awaiter.
        let mut once_taken = false;
        let mut i = 0;
        while i < state.subscribers.len() {
            let (matches, once) = {
                let sub = &state.subscribers[i];
                (
                    sub.kind == kind && sub.sequence_id.is_none_or(|seq| seq == frame.sequence_id),
                    matches!(sub.sink, Sink::Once(_)),
                )
            };
            if !matches || (once && once_taken) {
                i += 1;
                continue;
            }
            if once {
                // Removed before delivery so no second frame can reach it.
                let sub = state.subscribers.remove(i);
                if let Sink::Once(tx) = sub.sink
                    && tx.send(*frame).is_ok()
                {
                    once_taken = true;
                    delivered += 1;
                }
                continue;
            }
            let sent = match &state.subscribers[i].sink {
                Sink::Stream(tx) => tx.send(*frame).is_ok(),
                Sink::Once(_) => false,
            };
            if sent {
                delivered += 1;
                i += 1;
            } else {
                state.subscribers.remove(i);
            }
        }
        if delivered == 0 {
            debug!(%kind, seq = frame.sequence_id, "no subscriber for event");
        }
        delivered
    }

    /// Await the next frame of `kind`, optionally restricted to one sequence
    /// id. The registration is removed when the waiter is dropped.
    pub fn subscribe_once(&self, kind: EventKind, sequence_id: Option<u8>) -> Result<ResponseWaiter, RoveError> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(kind, sequence_id, Sink::Once(tx))?;
        Ok(ResponseWaiter {
            id,
            rx,
            state: self.state.clone(),
        })
    }

    /// Receive every frame of `kind` until the subscription is dropped.
    pub fn subscribe(&self, kind: EventKind) -> Result<Subscription, RoveError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.insert(kind, None, Sink::Stream(tx))?;
        Ok(Subscription {
            id,
            kind,
            rx,
            state: self.state.clone(),
        })
    }

    /// Number of live subscribers for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.state)
            .subscribers
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    /// Drop every subscriber and refuse new ones. Awaiters observe
    /// [`RoveError::ConnectionClosed`]; subscriptions end.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if !state.closed {
            debug!(dropped = state.subscribers.len(), "router closed");
        }
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Log `notice` and publish it to diagnostic listeners.
    pub fn report(&self, notice: LinkNotice) {
        match &notice {
            LinkNotice::CorruptFrame { expected, actual } => {
                warn!(expected, actual, "dropping corrupt frame")
            }
            LinkNotice::WrongFrameLength { len } => warn!(len, "dropping notification of wrong length"),
            LinkNotice::UnknownEvent { device, command } => {
                warn!(device, command, "ignoring unknown event")
            }
            LinkNotice::LostEvents { count, event_id } => warn!(lost = count, event_id, "events lost"),
            LinkNotice::UnexpectedResponse { kind, sequence_id } => {
                warn!(%kind, seq = sequence_id, "response matches no pending request")
            }
            LinkNotice::Postponed { device, command, attempts } => {
                debug!(device, command, attempts, "write postponed: link busy")
            }
        }
        // No listeners is the normal case.
        let _ = self.diagnostics.send(Diagnostic::now(notice));
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn insert(&self, kind: EventKind, sequence_id: Option<u8>, sink: Sink) -> Result<u64, RoveError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(RoveError::ConnectionClosed);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber {
            id,
            kind,
            sequence_id,
            sink,
        });
        Ok(id)
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<RouterState>) -> MutexGuard<'_, RouterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove(state: &Mutex<RouterState>, id: u64) {
    lock(state).subscribers.retain(|s| s.id != id);
}

// ---------------------------------------------------------------------------
// One-shot waiter
// ---------------------------------------------------------------------------

/// Pending one-shot registration. Resolves at most once.
pub struct ResponseWaiter {
    id: u64,
    rx: oneshot::Receiver<Frame>,
    state: Arc<Mutex<RouterState>>,
}

impl ResponseWaiter {
    /// Wait for the matching frame, or [`RoveError::ConnectionClosed`] when
    /// the router shuts down first.
    pub async fn recv(mut self) -> Result<Frame, RoveError> {
        (&mut self.rx).await.map_err(|_| RoveError::ConnectionClosed)
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        remove(&self.state, self.id);
    }
}

// ---------------------------------------------------------------------------
// Persistent subscription
// ---------------------------------------------------------------------------

/// A persistent subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    kind: EventKind,
    rx: mpsc::UnboundedReceiver<Frame>,
    state: Arc<Mutex<RouterState>>,
}

impl Subscription {
    /// Next frame, or `None` once the router is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        remove(&self.state, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(device: u8, command: u8, seq: u8) -> Frame {
        Frame::from_parts(device, command, seq, [0; 16])
    }

    #[test]
    fn classify_uses_device_and_command() {
        let router = EventRouter::new();
        assert_eq!(router.classify(&frame(1, 16, 3)), EventKind::Position);
        assert_eq!(
            router.classify(&frame(77, 1, 0)),
            EventKind::Unknown { device: 77, command: 1 }
        );
    }

    #[tokio::test]
    async fn one_shot_fires_once_for_matching_sequence() -> Result<(), Box<dyn std::error::Error>> {
        let router = EventRouter::new();
        let waiter = router.subscribe_once(EventKind::Position, Some(5))?;

        assert_eq!(router.dispatch(EventKind::Position, &frame(1, 16, 4)), 0);
        assert_eq!(router.dispatch(EventKind::Position, &frame(1, 16, 5)), 1);
        assert_eq!(router.dispatch(EventKind::Position, &frame(1, 16, 5)), 0);

        assert_eq!(waiter.recv().await?.sequence_id, 5);
        assert_eq!(router.subscriber_count(EventKind::Position), 0);
        Ok(())
    }

    #[tokio::test]
    async fn single_frame_cannot_satisfy_two_racing_awaiters() -> Result<(), Box<dyn std::error::Error>> {
        let router = EventRouter::new();
        let first = router.subscribe_once(EventKind::BatteryLevel, None)?;
        let second = router.subscribe_once(EventKind::BatteryLevel, None)?;

        let mut all = router.subscribe(EventKind::BatteryLevel)?;

        assert_eq!(router.dispatch(EventKind::BatteryLevel, &frame(14, 1, 1)), 2);
        assert_eq!(first.recv().await?.sequence_id, 1);
        assert_eq!(all.recv().await.ok_or("subscription closed")?.sequence_id, 1);
        assert_eq!(router.subscriber_count(EventKind::BatteryLevel), 2);

        let pending = tokio::time::timeout(Duration::from_millis(30), second.recv()).await;
        assert!(pending.is_err(), "second awaiter must still be waiting");
        Ok(())
    }

    #[tokio::test]
    async fn next_frame_goes_to_the_next_awaiter() -> Result<(), Box<dyn std::error::Error>> {
        let router = EventRouter::new();
        let first = router.subscribe_once(EventKind::BatteryLevel, None)?;
        let second = router.subscribe_once(EventKind::BatteryLevel, None)?;

        assert_eq!(router.dispatch(EventKind::BatteryLevel, &frame(14, 1, 1)), 1);
        assert_eq!(router.dispatch(EventKind::BatteryLevel, &frame(14, 1, 2)), 1);

        assert_eq!(first.recv().await?.sequence_id, 1);
        assert_eq!(second.recv().await?.sequence_id, 2);
        Ok(())
    }

    #[tokio::test]
    async fn persistent_subscribers_receive_in_insertion_order() -> Result<(), Box<dyn std::error::Error>> {
        let router = EventRouter::new();
        let mut a = router.subscribe(EventKind::Bumper)?;
        let once = router.subscribe_once(EventKind::Bumper, None)?;
        let mut b = router.subscribe(EventKind::Bumper)?;

        assert_eq!(router.dispatch(EventKind::Bumper, &frame(12, 0, 1)), 3);
        assert_eq!(router.dispatch(EventKind::Bumper, &frame(12, 0, 2)), 2);

        assert_eq!(a.recv().await.ok_or("a closed")?.sequence_id, 1);
        assert_eq!(a.recv().await.ok_or("a closed")?.sequence_id, 2);
        assert_eq!(once.recv().await?.sequence_id, 1);
        assert_eq!(b.recv().await.ok_or("b closed")?.sequence_id, 1);
        Ok(())
    }

    #[test]
    fn dropping_handles_unsubscribes() -> Result<(), Box<dyn std::error::Error>> {
        let router = EventRouter::new();
        let sub = router.subscribe(EventKind::IrProximityEvent)?;
        let waiter = router.subscribe_once(EventKind::IrProximityEvent, Some(1))?;
        assert_eq!(router.subscriber_count(EventKind::IrProximityEvent), 2);

        drop(sub);
        drop(waiter);
        assert_eq!(router.subscriber_count(EventKind::IrProximityEvent), 0);
        Ok(())
    }

    #[tokio::test]
    async fn close_resolves_waiters_with_connection_closed() -> Result<(), Box<dyn std::error::Error>> {
        let router = EventRouter::new();
        let waiter = router.subscribe_once(EventKind::Dock, None)?;
        let mut sub = router.subscribe(EventKind::Cliff)?;

        router.close();

        assert_eq!(waiter.recv().await.unwrap_err(), RoveError::ConnectionClosed);
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            router.subscribe(EventKind::Cliff),
            Err(RoveError::ConnectionClosed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn report_publishes_diagnostics() -> Result<(), Box<dyn std::error::Error>> {
        let router = EventRouter::new();
        let mut rx = router.diagnostics();
        router.report(LinkNotice::UnknownEvent { device: 9, command: 9 });
        let diag = rx.recv().await?;
        assert_eq!(diag.notice, LinkNotice::UnknownEvent { device: 9, command: 9 });
        Ok(())
    }
}
