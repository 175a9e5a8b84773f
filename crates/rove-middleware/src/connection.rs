//! One live link to a robot.
//!
//! [`Connection::open`] spawns two tasks over a [`Transport`]:
//!
//! | Task | Role |
//! |---|---|
//! | writer | owns the outbound queue; allocates sequence ids, writes frames, re-queues busy rejections at the front |
//! | pump | decodes inbound notifications, checks CRC, detects lost events, resolves requests and dispatches to the [`EventRouter`] |
//!
//! Callers never touch the transport directly. A request that expects a
//! response registers its one-shot waiter *before* the frame is written, so
//! a fast reply cannot be missed.
//!
//! # Busy handling
//!
//! A write rejected with [`RoveError::TransportBusy`] is postponed: its
//! sequence id is abandoned, it goes back to the head of the queue, and it is
//! retried with a fresh id on the next send cycle (a new request arriving or
//! the retry tick, whichever comes first). Requests queued behind it keep
//! their relative order.
//!
//! # Closure
//!
//! A fatal write error or the end of the notification stream closes the
//! router: pending awaiters and later requests resolve with
//! [`RoveError::ConnectionClosed`]; the write that failed reports the
//! transport error itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use rove_types::frame::pad_payload;
use rove_types::{Diagnostic, EventKind, Frame, LinkNotice, MAX_PAYLOAD, RoveError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, debug_span, error, info, info_span, instrument, trace, warn};
use uuid::Uuid;

use crate::router::{EventRouter, ResponseWaiter, Subscription};
use crate::tracker::{EventIdCounter, RequestKey, RequestState, RequestTracker};
use crate::transport::Transport;

/// Tracing target for per-frame events and spans. Enable it with
/// `RUST_LOG=rove::link=trace` to see every frame on the wire.
pub const LINK_TARGET: &str = "rove::link";

/// Link tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Retry tick for a postponed write when nothing else is queued.
    pub busy_retry_interval: Duration,
    /// Give up on a request after this many busy rejections. `None` retries
    /// until the link accepts it or closes.
    pub max_busy_retries: Option<u32>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            busy_retry_interval: Duration::from_millis(20),
            max_busy_retries: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

struct Shared {
    tracker: Mutex<RequestTracker>,
    events: Mutex<EventIdCounter>,
    router: EventRouter,
}

impl Shared {
    fn tracker(&self) -> MutexGuard<'_, RequestTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one notification from the transport.
    fn ingest(&self, bytes: &[u8]) -> Option<EventKind> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(RoveError::CorruptFrame { expected, actual }) => {
                self.router.report(LinkNotice::CorruptFrame { expected, actual });
                return None;
            }
            Err(_) => {
                self.router.report(LinkNotice::WrongFrameLength { len: bytes.len() });
                return None;
            }
        };

        let kind = self.router.classify(&frame);
        if let EventKind::Unknown { device, command } = kind {
            self.router.report(LinkNotice::UnknownEvent { device, command });
            return None;
        }

        if kind.is_unsolicited() {
            let lost = self
                .events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observe(frame.sequence_id);
            if lost > 0 {
                self.router.report(LinkNotice::LostEvents {
                    count: lost,
                    event_id: frame.sequence_id,
                });
            }
        } else if self.tracker().resolve(&frame).is_none() {
            self.router.report(LinkNotice::UnexpectedResponse {
                kind,
                sequence_id: frame.sequence_id,
            });
        }

        let delivered = self.router.dispatch(kind, &frame);
        trace!(
            target: LINK_TARGET,
            %kind,
            device = frame.device,
            command = frame.command,
            seq = frame.sequence_id,
            delivered,
            "frame in"
        );
        Some(kind)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound queue entries
// ────────────────────────────────────────────────────────────────────────────

type ReplyTx = oneshot::Sender<Result<Frame, RoveError>>;

enum Reply {
    /// Resolve once the transport accepts the frame.
    Written(ReplyTx),
    /// Resolve with the matching response frame.
    Response { kind: EventKind, tx: ReplyTx },
}

struct Outgoing {
    device: u8,
    command: u8,
    payload: [u8; MAX_PAYLOAD],
    state: RequestState,
    busy_rejections: u32,
    reply: Reply,
}

impl Outgoing {
    fn new(device: u8, command: u8, payload: [u8; MAX_PAYLOAD], reply: Reply) -> Self {
        Self {
            device,
            command,
            payload,
            state: RequestState::Queued,
            busy_rejections: 0,
            reply,
        }
    }

    fn reply_tx(&self) -> &ReplyTx {
        match &self.reply {
            Reply::Written(tx) | Reply::Response { tx, .. } => tx,
        }
    }

    /// The caller dropped its future.
    fn is_abandoned(&self) -> bool {
        self.reply_tx().is_closed()
    }

    fn fail(self, err: RoveError) {
        let (Reply::Written(tx) | Reply::Response { tx, .. }) = self.reply;
        let _ = tx.send(Err(err));
    }
}

enum Attempt {
    Done,
    Busy(Outgoing),
    Fatal(RoveError),
}

// ────────────────────────────────────────────────────────────────────────────
// Writer task
// ────────────────────────────────────────────────────────────────────────────

struct Writer {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    config: LinkConfig,
    inbox: mpsc::UnboundedReceiver<Outgoing>,
    inbox_open: bool,
    queue: VecDeque<Outgoing>,
}

impl Writer {
    async fn run(mut self) {
        loop {
            if self.queue.is_empty() {
                match self.inbox.recv().await {
                    Some(req) => self.queue.push_back(req),
                    None => break,
                }
            }
            while let Ok(req) = self.inbox.try_recv() {
                self.queue.push_back(req);
            }
            let Some(req) = self.queue.pop_front() else {
                continue;
            };
            if req.is_abandoned() {
                debug!(device = req.device, command = req.command, "dropping abandoned request");
                continue;
            }

            match self.attempt(req).await {
                Attempt::Done => {}
                Attempt::Busy(req) => self.postpone(req).await,
                Attempt::Fatal(err) => {
                    self.shutdown(err);
                    return;
                }
            }
        }
        debug!("request channel closed, writer exiting");
    }

    async fn attempt(&mut self, req: Outgoing) -> Attempt {
        if self.shared.router.is_closed() {
            req.fail(RoveError::ConnectionClosed);
            return Attempt::Done;
        }
        let sequence_id = match self.shared.tracker().allocate() {
            Ok(id) => id,
            Err(err) => {
                req.fail(err);
                return Attempt::Done;
            }
        };
        let frame = Frame::from_parts(req.device, req.command, sequence_id, req.payload);
        let key = RequestKey::of(&frame);

        let expected = match &req.reply {
            Reply::Response { kind, .. } => Some(*kind),
            Reply::Written(_) => None,
        };
        let waiter: Option<ResponseWaiter> = match expected {
            Some(kind) => match self.shared.router.subscribe_once(kind, Some(sequence_id)) {
                Ok(waiter) => {
                    self.shared.tracker().track(key, kind, req.payload);
                    Some(waiter)
                }
                Err(err) => {
                    req.fail(err);
                    return Attempt::Done;
                }
            },
            None => None,
        };

        let span = debug_span!(
            target: LINK_TARGET,
            "frame_out",
            device = req.device,
            command = req.command,
            seq = sequence_id,
            expects = ?expected
        );
        let written = async {
            trace!(target: LINK_TARGET, state = ?req.state, attempt = req.busy_rejections + 1, "writing frame");
            self.transport.write(frame.encode()).await
        }
        .instrument(span)
        .await;
        match written {
            Ok(()) => {
                match req.reply {
                    Reply::Written(tx) => {
                        let _ = tx.send(Ok(frame));
                    }
                    Reply::Response { tx, .. } => {
                        self.shared.tracker().mark_awaiting(&key);
                        if let Some(waiter) = waiter {
                            tokio::spawn(await_response(waiter, tx, key, self.shared.clone()));
                        }
                    }
                }
                Attempt::Done
            }
            Err(RoveError::TransportBusy) => {
                drop(waiter);
                self.shared.tracker().postpone(&key);
                let mut req = req;
                req.state = RequestState::Postponed;
                req.busy_rejections += 1;
                Attempt::Busy(req)
            }
            Err(err) => {
                drop(waiter);
                self.shared.tracker().abandon(&key);
                req.fail(err.clone());
                Attempt::Fatal(err)
            }
        }
    }

    async fn postpone(&mut self, req: Outgoing) {
        let exhausted = self
            .config
            .max_busy_retries
            .is_some_and(|max| req.busy_rejections > max);
        if exhausted {
            warn!(
                device = req.device,
                command = req.command,
                rejections = req.busy_rejections,
                "giving up on busy request"
            );
            req.fail(RoveError::TransportBusy);
            return;
        }
        self.shared.router.report(LinkNotice::Postponed {
            device: req.device,
            command: req.command,
            attempts: req.busy_rejections,
        });
        self.queue.push_front(req);

        tokio::select! {
            incoming = self.inbox.recv(), if self.inbox_open => match incoming {
                Some(req) => self.queue.push_back(req),
                None => self.inbox_open = false,
            },
            _ = tokio::time::sleep(self.config.busy_retry_interval) => {}
        }
    }

    fn shutdown(&mut self, err: RoveError) {
        error!(error = %err, "transport failed, closing connection");
        self.shared.router.close();
        self.shared.tracker().clear();
        self.inbox.close();
        while let Ok(req) = self.inbox.try_recv() {
            self.queue.push_back(req);
        }
        for req in self.queue.drain(..) {
            req.fail(RoveError::ConnectionClosed);
        }
    }
}

/// Forward the response to the caller, or forget the request if the caller
/// gave up first.
async fn await_response(waiter: ResponseWaiter, mut tx: ReplyTx, key: RequestKey, shared: Arc<Shared>) {
    tokio::select! {
        result = waiter.recv() => {
            if result.is_err() {
                shared.tracker().abandon(&key);
            }
            let _ = tx.send(result);
        }
        _ = tx.closed() => {
            shared.tracker().abandon(&key);
            debug!(seq = key.sequence_id, "caller stopped waiting");
        }
    }
}

async fn run_pump(mut notifications: BoxStream<'static, Vec<u8>>, shared: Arc<Shared>) {
    while let Some(bytes) = notifications.next().await {
        shared.ingest(&bytes);
    }
    info!("notification stream ended");
    shared.router.close();
    shared.tracker().clear();
}

// ────────────────────────────────────────────────────────────────────────────
// Connection
// ────────────────────────────────────────────────────────────────────────────

/// Handle to an open link. Dropping it stops both background tasks.
pub struct Connection {
    id: Uuid,
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Outgoing>,
    writer: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl Connection {
    /// Start the writer and notification pump over `transport`.
    pub async fn open(transport: Arc<dyn Transport>, config: LinkConfig) -> Self {
        let id = Uuid::new_v4();
        let shared = Arc::new(Shared {
            tracker: Mutex::new(RequestTracker::new()),
            events: Mutex::new(EventIdCounter::new()),
            router: EventRouter::new(),
        });

        let notifications = transport.notifications().await;
        let pump = tokio::spawn(
            run_pump(notifications, shared.clone()).instrument(info_span!("rove_pump", conn = %id)),
        );

        let (requests, inbox) = mpsc::unbounded_channel();
        let writer = Writer {
            transport,
            shared: shared.clone(),
            config,
            inbox,
            inbox_open: true,
            queue: VecDeque::new(),
        };
        let writer = tokio::spawn(writer.run().instrument(info_span!("rove_writer", conn = %id)));

        info!(conn = %id, "connection opened");
        Self {
            id,
            shared,
            requests,
            writer,
            pump,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Write a command; resolves with the frame as written once the
    /// transport accepts it.
    #[instrument(skip(self, payload), fields(conn = %self.id))]
    pub async fn send_without_response(&self, device: u8, command: u8, payload: &[u8]) -> Result<Frame, RoveError> {
        let payload = pad_payload(payload)?;
        let (tx, rx) = oneshot::channel();
        self.enqueue(Outgoing::new(device, command, payload, Reply::Written(tx)))?;
        rx.await.map_err(|_| RoveError::ConnectionClosed)?
    }

    /// Write a command and wait for the response of `kind` carrying the same
    /// sequence id.
    #[instrument(skip(self, payload), fields(conn = %self.id))]
    pub async fn send_with_response(
        &self,
        kind: EventKind,
        device: u8,
        command: u8,
        payload: &[u8],
    ) -> Result<Frame, RoveError> {
        let payload = pad_payload(payload)?;
        let (tx, rx) = oneshot::channel();
        self.enqueue(Outgoing::new(device, command, payload, Reply::Response { kind, tx }))?;
        rx.await.map_err(|_| RoveError::ConnectionClosed)?
    }

    /// Stream every frame of `kind` until the subscription is dropped.
    pub fn subscribe(&self, kind: EventKind) -> Result<Subscription, RoveError> {
        self.shared.router.subscribe(kind)
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.shared.router.subscriber_count(kind)
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.shared.router.diagnostics()
    }

    pub fn router(&self) -> &EventRouter {
        &self.shared.router
    }

    /// Requests written and still waiting for their response.
    pub fn in_flight(&self) -> usize {
        self.shared.tracker().in_flight()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.router.is_closed()
    }

    fn enqueue(&self, req: Outgoing) -> Result<(), RoveError> {
        if self.shared.router.is_closed() {
            return Err(RoveError::ConnectionClosed);
        }
        self.requests.send(req).map_err(|_| RoveError::ConnectionClosed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.router.close();
        self.writer.abort();
        self.pump.abort();
        debug!(conn = %self.id, "connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRobot;
    use rove_types::protocol::{device, motors};

    async fn open(sim: &Arc<SimRobot>) -> Connection {
        Connection::open(sim.clone(), LinkConfig::default()).await
    }

    #[tokio::test]
    async fn response_is_matched_by_sequence_id() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let conn = open(&sim).await;

        let first = conn
            .send_with_response(EventKind::Position, device::MOTORS, motors::GET_POSITION, &[])
            .await?;
        let second = conn
            .send_with_response(EventKind::Position, device::MOTORS, motors::GET_POSITION, &[])
            .await?;
        assert_eq!(first.sequence_id, 0);
        assert_eq!(second.sequence_id, 1);
        assert_eq!(conn.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn payload_too_large_is_rejected_before_writing() {
        let sim = Arc::new(SimRobot::new());
        let conn = open(&sim).await;
        let err = conn.send_without_response(0, 1, &[b'x'; 17]).await;
        assert_eq!(err, Err(RoveError::PayloadTooLarge(17)));
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn busy_request_is_resent_first_with_a_fresh_id() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let conn = open(&sim).await;
        sim.reject_next_writes(1);
        let mut diagnostics = conn.diagnostics();

        let (a, b) = tokio::join!(
            conn.send_with_response(EventKind::Position, device::MOTORS, motors::GET_POSITION, &[]),
            conn.send_without_response(device::MOTORS, motors::SET_SPEED, &[0, 0, 0, 10, 0, 0, 0, 10]),
        );
        let (a, b) = (a?, b?);

        let rejected = sim.rejected();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].command, motors::GET_POSITION);

        let writes = sim.writes();
        assert_eq!(writes[0].command, motors::GET_POSITION, "postponed request goes first");
        assert_eq!(writes[1].command, motors::SET_SPEED);
        assert_ne!(a.sequence_id, rejected[0].sequence_id);
        assert_eq!(writes[1].sequence_id, b.sequence_id);

        let notice = diagnostics.recv().await?;
        assert!(matches!(notice.notice, LinkNotice::Postponed { attempts: 1, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn bounded_busy_retries_give_up() {
        let sim = Arc::new(SimRobot::new());
        let config = LinkConfig {
            busy_retry_interval: Duration::from_millis(1),
            max_busy_retries: Some(2),
        };
        let conn = Connection::open(sim.clone(), config).await;
        sim.reject_next_writes(10);

        let result = conn.send_without_response(device::MOTORS, motors::SET_SPEED, &[0; 8]).await;
        assert_eq!(result, Err(RoveError::TransportBusy));
        assert_eq!(sim.rejected().len(), 3);
    }

    #[tokio::test]
    async fn corrupt_and_unknown_frames_are_reported_not_dispatched() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let conn = open(&sim).await;
        let mut diagnostics = conn.diagnostics();
        let mut bumps = conn.subscribe(EventKind::Bumper)?;

        let mut corrupt = Frame::new(12, 0, 0, &[0, 0, 0, 0, 0x80])?.encode();
        corrupt[7] ^= 0x01;
        sim.inject(corrupt.to_vec());
        sim.inject(Frame::new(42, 7, 0, &[])?.encode().to_vec());
        sim.inject(vec![0; 5]);
        sim.emit_event(12, 0, &[0x40]);

        assert!(matches!(diagnostics.recv().await?.notice, LinkNotice::CorruptFrame { .. }));
        assert!(matches!(
            diagnostics.recv().await?.notice,
            LinkNotice::UnknownEvent { device: 42, command: 7 }
        ));
        assert!(matches!(diagnostics.recv().await?.notice, LinkNotice::WrongFrameLength { len: 5 }));

        let frame = bumps.recv().await.ok_or("subscription closed")?;
        assert_eq!(frame.payload()[4], 0x40);
        Ok(())
    }

    #[tokio::test]
    async fn gap_in_event_ids_reports_lost_events() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let conn = open(&sim).await;
        let mut diagnostics = conn.diagnostics();
        let mut bumps = conn.subscribe(EventKind::Bumper)?;

        sim.emit_event(12, 0, &[0x80]);
        sim.emit_event(12, 0, &[0x80]);
        sim.drop_events(2);
        sim.emit_event(12, 0, &[0x80]);

        for _ in 0..3 {
            bumps.recv().await.ok_or("subscription closed")?;
        }
        let notice = diagnostics.recv().await?;
        assert!(matches!(notice.notice, LinkNotice::LostEvents { count: 2, event_id: 4 }));
        Ok(())
    }

    #[tokio::test]
    async fn response_nobody_asked_for_is_reported_and_still_dispatched() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let conn = open(&sim).await;
        let mut diagnostics = conn.diagnostics();
        let mut positions = conn.subscribe(EventKind::Position)?;

        sim.inject(Frame::new(1, 16, 77, &[])?.encode().to_vec());

        assert!(positions.recv().await.is_some());
        assert!(matches!(
            diagnostics.recv().await?.notice,
            LinkNotice::UnexpectedResponse { kind: EventKind::Position, sequence_id: 77 }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stream_end_resolves_pending_awaiters() {
        let sim = Arc::new(SimRobot::new());
        let conn = open(&sim).await;
        sim.mute(true);

        let pending = conn.send_with_response(EventKind::Position, device::MOTORS, motors::GET_POSITION, &[]);
        let (result, ()) = tokio::join!(pending, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sim.disconnect();
        });
        assert_eq!(result, Err(RoveError::ConnectionClosed));

        let later = conn.send_without_response(device::MOTORS, motors::SET_SPEED, &[0; 8]).await;
        assert_eq!(later, Err(RoveError::ConnectionClosed));
    }

    #[tokio::test]
    async fn fatal_write_fails_that_request_and_closes() {
        let sim = Arc::new(SimRobot::new());
        let conn = open(&sim).await;
        sim.fail_link();

        let result = conn.send_without_response(device::MOTORS, motors::SET_SPEED, &[0; 8]).await;
        assert!(matches!(result, Err(RoveError::TransportFatal(_))));

        let later = conn
            .send_with_response(EventKind::Position, device::MOTORS, motors::GET_POSITION, &[])
            .await;
        assert_eq!(later, Err(RoveError::ConnectionClosed));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn dropped_caller_releases_its_request() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let conn = open(&sim).await;
        sim.mute(true);

        let pending = conn.send_with_response(EventKind::Position, device::MOTORS, motors::GET_POSITION, &[]);
        let timed_out = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(conn.subscriber_count(EventKind::Position), 0);
        Ok(())
    }
}
