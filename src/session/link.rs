//! State shared between a connection's I/O tasks and its match

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::game::Command;
use crate::util::time::Tick;

use super::queue::{BoundedQueue, CommandQueue};
use super::SessionId;

const NO_ACK: u64 = u64::MAX;

/// Smoothing factor for round-trip samples (1/8, as in TCP's SRTT)
const RTT_ALPHA: f64 = 0.125;

/// Server heartbeats awaiting an echo; older ones are forgotten
const OUTSTANDING_HEARTBEATS: usize = 8;

/// Ceiling on a single round-trip sample unless configured otherwise
const DEFAULT_MAX_RTT_MS: u64 = 2_000;

#[derive(Default)]
struct HeartbeatLog {
    last_sequence: u32,
    /// (sequence, server send time)
    outstanding: VecDeque<(u32, u64)>,
}

/// Connection handle for one session.
///
/// The reader task pushes commands and records acks and RTT samples; the
/// writer task drains the egress queue; the tick loop does the opposite of
/// both. Nothing else is shared.
pub struct SessionLink {
    id: SessionId,
    ingress: CommandQueue,
    egress: BoundedQueue<Bytes>,
    last_command_ms: AtomicU64,
    /// f64 bits of the smoothed RTT in milliseconds
    rtt_ms: AtomicU64,
    acked_tick: AtomicU64,
    heartbeats: Mutex<HeartbeatLog>,
    max_rtt_ms: u64,
    /// Set when the egress queue dropped a frame the client will never see
    egress_shed: AtomicBool,
    closed: AtomicBool,
}

impl SessionLink {
    pub fn new(id: SessionId, ingress_capacity: usize, egress_capacity: usize, now_ms: u64) -> Self {
        Self {
            id,
            ingress: CommandQueue::new(ingress_capacity),
            egress: BoundedQueue::new(egress_capacity),
            last_command_ms: AtomicU64::new(now_ms),
            rtt_ms: AtomicU64::new(0f64.to_bits()),
            acked_tick: AtomicU64::new(NO_ACK),
            heartbeats: Mutex::new(HeartbeatLog::default()),
            max_rtt_ms: DEFAULT_MAX_RTT_MS,
            egress_shed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Cap each round-trip sample, normally at the snapshot history length
    pub fn with_max_rtt_ms(mut self, max_rtt_ms: u64) -> Self {
        self.max_rtt_ms = max_rtt_ms.max(1);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn ingress(&self) -> &CommandQueue {
        &self.ingress
    }

    /// Queue a received command and refresh the silence timer
    pub fn push_command(&self, command: Command) {
        if self.is_closed() {
            return;
        }
        self.last_command_ms
            .fetch_max(command.received_at_ms, Ordering::Relaxed);
        if let Some(dropped) = self.ingress.push(command) {
            debug!(session_id = self.id, sequence = dropped.sequence, "Ingress full, dropped oldest command");
        }
    }

    pub fn last_command_ms(&self) -> u64 {
        self.last_command_ms.load(Ordering::Relaxed)
    }

    /// Reset the silence timer, e.g. when a session is resumed on a new connection
    pub fn touch(&self, now_ms: u64) {
        self.last_command_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// Fire-and-forget send; a full egress queue sheds its oldest message
    pub fn send(&self, frame: Bytes) {
        if self.is_closed() {
            return;
        }
        if self.egress.push(frame).is_some() {
            self.egress_shed.store(true, Ordering::Release);
            debug!(session_id = self.id, "Egress full, dropped oldest message");
        }
    }

    /// Whether a frame has been shed since the last call
    pub fn take_egress_shed(&self) -> bool {
        self.egress_shed.swap(false, Ordering::AcqRel)
    }

    /// Next frame for the writer task. Returns `None` once the link is closed
    /// and everything queued before the close has been handed out.
    pub async fn next_outbound(&self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.egress.pop() {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }
            self.egress.notified().await;
        }
    }

    /// Non-blocking variant of [`SessionLink::next_outbound`]
    pub fn try_next_outbound(&self) -> Option<Bytes> {
        self.egress.pop()
    }

    /// Record a client acknowledgement; acks never move backwards
    pub fn ack(&self, tick: Tick) {
        let tick = tick as u64;
        let _ = self
            .acked_tick
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current == NO_ACK || tick > current).then_some(tick)
            });
    }

    pub fn acked_tick(&self) -> Option<Tick> {
        match self.acked_tick.load(Ordering::Relaxed) {
            NO_ACK => None,
            tick => Some(tick as Tick),
        }
    }

    /// Register a server heartbeat sent at `now_ms` and return its sequence
    pub fn begin_heartbeat(&self, now_ms: u64) -> u32 {
        let mut log = self.heartbeats.lock();
        log.last_sequence = log.last_sequence.wrapping_add(1);
        let sequence = log.last_sequence;
        if log.outstanding.len() >= OUTSTANDING_HEARTBEATS {
            log.outstanding.pop_front();
        }
        log.outstanding.push_back((sequence, now_ms));
        sequence
    }

    /// Match an echoed heartbeat against the outstanding ones. Only the
    /// server's own send time is used; unknown or repeated sequences are
    /// ignored and return false.
    pub fn complete_heartbeat(&self, sequence: u32, now_ms: u64) -> bool {
        let sent_ms = {
            let mut log = self.heartbeats.lock();
            let Some(idx) = log.outstanding.iter().position(|(s, _)| *s == sequence) else {
                return false;
            };
            // Echoes arrive in order, so anything older is lost
            match log.outstanding.drain(..=idx).last() {
                Some((_, sent_ms)) => sent_ms,
                None => return false,
            }
        };
        let sample = now_ms.saturating_sub(sent_ms).min(self.max_rtt_ms);
        self.record_rtt_sample(sample as f64);
        true
    }

    /// Fold a heartbeat round-trip sample into the smoothed estimate
    fn record_rtt_sample(&self, sample_ms: f64) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return;
        }
        let _ = self
            .rtt_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let current = f64::from_bits(bits);
                let next = if current == 0.0 {
                    sample_ms
                } else {
                    current + RTT_ALPHA * (sample_ms - current)
                };
                Some(next.to_bits())
            });
    }

    pub fn rtt_ms(&self) -> f64 {
        f64::from_bits(self.rtt_ms.load(Ordering::Relaxed))
    }

    /// Close the link: pending input is discarded and the writer is woken so
    /// it can flush what is already queued and exit.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.ingress.clear();
            self.egress.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Action, Vec2};

    fn link() -> SessionLink {
        SessionLink::new(1, 8, 4, 1_000)
    }

    #[test]
    fn acks_are_monotonic() {
        let link = link();
        assert_eq!(link.acked_tick(), None);
        link.ack(10);
        link.ack(7);
        assert_eq!(link.acked_tick(), Some(10));
        link.ack(0);
        assert_eq!(link.acked_tick(), Some(10));
    }

    #[test]
    fn rtt_is_smoothed() {
        let link = link();
        link.record_rtt_sample(100.0);
        assert_eq!(link.rtt_ms(), 100.0);
        link.record_rtt_sample(180.0);
        assert!((link.rtt_ms() - 110.0).abs() < 1e-9);
        link.record_rtt_sample(f64::NAN);
        assert!((link.rtt_ms() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn only_outstanding_heartbeats_produce_rtt() {
        let link = link().with_max_rtt_ms(1_000);
        assert!(!link.complete_heartbeat(1, 5_000));
        assert_eq!(link.rtt_ms(), 0.0);

        let first = link.begin_heartbeat(10_000);
        let second = link.begin_heartbeat(11_000);
        assert!(link.complete_heartbeat(second, 11_060));
        assert_eq!(link.rtt_ms(), 60.0);

        // Superseded and repeated echoes are ignored
        assert!(!link.complete_heartbeat(first, 11_070));
        assert!(!link.complete_heartbeat(second, 11_080));
        assert_eq!(link.rtt_ms(), 60.0);
    }

    #[test]
    fn rtt_samples_are_capped() {
        let link = link().with_max_rtt_ms(1_000);
        let sequence = link.begin_heartbeat(0);
        assert!(link.complete_heartbeat(sequence, 90_000));
        assert_eq!(link.rtt_ms(), 1_000.0);
    }

    #[test]
    fn outstanding_heartbeats_are_bounded() {
        let link = link();
        let oldest = link.begin_heartbeat(0);
        for k in 1..=OUTSTANDING_HEARTBEATS as u64 {
            link.begin_heartbeat(k * 1_000);
        }
        assert!(!link.complete_heartbeat(oldest, 9_000));
    }

    #[test]
    fn shedding_egress_is_reported_once() {
        let link = link();
        for frame in [b"1", b"2", b"3", b"4"] {
            link.send(Bytes::from_static(frame));
        }
        assert!(!link.take_egress_shed());
        link.send(Bytes::from_static(b"5"));
        assert!(link.take_egress_shed());
        assert!(!link.take_egress_shed());
        assert_eq!(link.try_next_outbound(), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn commands_refresh_silence_timer() {
        let link = link();
        link.push_command(Command {
            session: 1,
            sequence: 1,
            client_tick: 0,
            action: Action::Move { displacement: Vec2::ZERO },
            received_at_ms: 1_700,
        });
        assert_eq!(link.last_command_ms(), 1_700);
        assert_eq!(link.ingress().len(), 1);
    }

    #[tokio::test]
    async fn writer_drains_then_stops_after_close() {
        let link = link();
        link.send(Bytes::from_static(b"a"));
        link.send(Bytes::from_static(b"b"));
        link.close();
        link.send(Bytes::from_static(b"c"));

        assert_eq!(link.next_outbound().await, Some(Bytes::from_static(b"a")));
        assert_eq!(link.next_outbound().await, Some(Bytes::from_static(b"b")));
        assert_eq!(link.next_outbound().await, None);
    }

    #[test]
    fn writer_wakes_on_send_and_close() {
        let link = link();
        let mut next = tokio_test::task::spawn(link.next_outbound());
        tokio_test::assert_pending!(next.poll());

        link.send(Bytes::from_static(b"hello"));
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), Some(Bytes::from_static(b"hello")));
        drop(next);

        let mut next = tokio_test::task::spawn(link.next_outbound());
        tokio_test::assert_pending!(next.poll());
        link.close();
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), None);
    }
}
