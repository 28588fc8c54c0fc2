//! # ARQ — Acknowledged Retransmission
//!
//! Sender-side reliability for command packets. Every reliable datagram is
//! registered with the [`Retransmitter`] when it is first sent and stays
//! there until the peer acknowledges its wire id. A periodic tick resends
//! whatever is due, spaced by the RTO from the [`RttEstimator`].
//!
//! ## Key design decisions
//!
//! - **Karn's algorithm**: only never-resent packets feed the RTT estimator
//! - **Linger after ack**: acknowledged entries stay for a few RTOs so late
//!   acks of resent copies still match
//! - **Bounded retries**: a packet resent more than the budget and pending
//!   past the timeout fails the connection
//! - **Listeners outside the lock**: completion callbacks may re-enter

use bytes::Bytes;
use parking_lot::Mutex;
use quanta::{Clock, Instant};
use slab::Slab;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::wire::PacketType;

/// Completion callback of a reliable send: `true` once acknowledged, `false`
/// when the packet failed or the connection was reset.
pub type AckListener = Box<dyn FnOnce(bool) + Send>;

// ─── RTT Estimator (Jacobson/Karels) ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_us: f64,
    rttvar_us: f64,
    rto_us: f64,
    initial_rto_us: f64,
    min_rto_us: f64,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(200))
    }
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration) -> Self {
        let initial_rto_us = initial_rto.as_micros() as f64;
        RttEstimator {
            srtt_us: 0.0,
            rttvar_us: 0.0,
            rto_us: initial_rto_us,
            initial_rto_us,
            min_rto_us: min_rto.as_micros() as f64,
            has_sample: false,
        }
    }

    /// Feed one round-trip sample.
    pub fn update(&mut self, sample: Duration) {
        let sample_us = sample.as_micros() as f64;
        if !self.has_sample {
            self.has_sample = true;
            self.srtt_us = sample_us;
            self.rttvar_us = sample_us / 2.0;
            self.rto_us = self.srtt_us + 4.0 * self.rttvar_us;
            return;
        }

        self.rttvar_us += 0.25 * ((self.srtt_us - sample_us).abs() - self.rttvar_us);
        self.srtt_us += 0.125 * (sample_us - self.srtt_us);
        self.rto_us = (self.srtt_us + 4.0 * self.rttvar_us).max(self.min_rto_us);
    }

    #[inline]
    pub fn rto(&self) -> Duration {
        Duration::from_micros(self.rto_us.round() as u64)
    }

    #[inline]
    pub fn srtt(&self) -> Duration {
        Duration::from_micros(self.srtt_us.round() as u64)
    }

    #[inline]
    pub fn rttvar(&self) -> Duration {
        Duration::from_micros(self.rttvar_us.round() as u64)
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn reset(&mut self) {
        self.srtt_us = 0.0;
        self.rttvar_us = 0.0;
        self.rto_us = self.initial_rto_us;
        self.has_sample = false;
    }
}

// ─── Retransmitter ──────────────────────────────────────────────────────────

/// Timing knobs of the [`Retransmitter`].
#[derive(Debug, Clone)]
pub struct RetransmitConfig {
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_resend_interval: Duration,
    pub resend_budget: u32,
    pub resend_timeout: Duration,
    pub ack_linger_rto_factor: u32,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        RetransmitConfig::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for RetransmitConfig {
    fn from(cfg: &TransportConfig) -> Self {
        RetransmitConfig {
            initial_rto: cfg.initial_rto,
            min_rto: cfg.min_rto,
            max_resend_interval: cfg.max_resend_interval,
            resend_budget: cfg.resend_budget,
            resend_timeout: cfg.resend_timeout,
            ack_linger_rto_factor: cfg.ack_linger_rto_factor,
        }
    }
}

/// One in-flight reliable datagram.
pub struct ResendEntry {
    pub packet_type: PacketType,
    pub full_id: u32,
    pub first_send: Instant,
    pub next_resend: Instant,
    pub resend_count: u32,
    /// Copies sent and not yet acknowledged.
    pub send_count: u32,
    pub acknowledged: bool,
    /// Encrypted datagram, shared with the write queue.
    pub datagram: Bytes,
    listener: Option<AckListener>,
}

/// A datagram due for resending.
#[derive(Debug, Clone)]
pub struct Resend {
    pub packet_type: PacketType,
    pub full_id: u32,
    pub resend_count: u32,
    pub datagram: Bytes,
}

struct RetransmitState {
    entries: Slab<ResendEntry>,
    rtt: RttEstimator,
}

pub struct Retransmitter {
    state: Mutex<RetransmitState>,
    clock: Clock,
    config: RetransmitConfig,
}

impl Retransmitter {
    pub fn new(config: RetransmitConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    /// Use an explicit clock, e.g. `Clock::mock()` in tests.
    pub fn with_clock(config: RetransmitConfig, clock: Clock) -> Self {
        Retransmitter {
            state: Mutex::new(RetransmitState {
                entries: Slab::new(),
                rtt: RttEstimator::new(config.initial_rto, config.min_rto),
            }),
            clock,
            config,
        }
    }

    #[inline]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn current_rto(&self) -> Duration {
        self.state.lock().rtt.rto()
    }

    pub fn rtt_estimator(&self) -> RttEstimator {
        self.state.lock().rtt.clone()
    }

    /// Entries still tracked, acknowledged ones lingering included.
    pub fn awaiting_acknowledge(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Register a reliable datagram that was just sent.
    pub fn process_packet(
        &self,
        packet_type: PacketType,
        full_id: u32,
        datagram: Bytes,
        listener: Option<AckListener>,
    ) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let rto = state.rtt.rto();
        state.entries.insert(ResendEntry {
            packet_type,
            full_id,
            first_send: now,
            next_resend: now + rto,
            resend_count: 0,
            send_count: 1,
            acknowledged: false,
            datagram,
            listener,
        });
    }

    /// Match an acknowledgement of type `ack_type` (ACK or ACK_LOW) for
    /// `wire_id`. Returns false when nothing is waiting for it.
    pub fn process_acknowledge(&self, ack_type: PacketType, wire_id: u16) -> bool {
        let target_type = ack_type.acknowledged_type();
        let now = self.clock.now();

        let listener = {
            let mut state = self.state.lock();
            let Some(key) = state.entries.iter().find_map(|(key, entry)| {
                (entry.packet_type == target_type && (entry.full_id & 0xFFFF) as u16 == wire_id)
                    .then_some(key)
            }) else {
                return false;
            };

            let entry = &mut state.entries[key];
            let listener = entry.listener.take();
            entry.acknowledged = true;
            entry.send_count = entry.send_count.saturating_sub(1);
            if entry.send_count == 0 {
                let entry = state.entries.remove(key);
                if entry.resend_count == 0 {
                    state
                        .rtt
                        .update(now.saturating_duration_since(entry.first_send));
                }
            }
            listener
        };

        if let Some(listener) = listener {
            listener(true);
        }
        true
    }

    /// Collect due resends into `out` and pull `next_resend` forward to the
    /// earliest pending deadline.
    ///
    /// Packets past their retry budget are dropped, their listeners told
    /// `false`, and the first of them is returned as an error.
    pub fn execute_resend(
        &self,
        now: Instant,
        next_resend: &mut Instant,
        out: &mut Vec<Resend>,
    ) -> Result<usize, TransportError> {
        let mut resent = 0;
        let failed: Vec<ResendEntry> = {
            let mut state = self.state.lock();
            let rto = state.rtt.rto();
            let linger = rto * self.config.ack_linger_rto_factor;
            let interval = rto.min(self.config.max_resend_interval);

            let mut collect = Vec::new();
            let mut failed = Vec::new();
            for (key, entry) in state.entries.iter_mut() {
                if entry.acknowledged {
                    if entry.next_resend + linger <= now {
                        collect.push(key);
                    }
                    continue;
                }

                if entry.next_resend <= now {
                    if entry.resend_count > self.config.resend_budget
                        && entry.first_send + self.config.resend_timeout < now
                    {
                        failed.push(key);
                        continue;
                    }
                    entry.next_resend = now + interval;
                    entry.resend_count += 1;
                    entry.send_count += 1;
                    out.push(Resend {
                        packet_type: entry.packet_type,
                        full_id: entry.full_id,
                        resend_count: entry.resend_count,
                        datagram: entry.datagram.clone(),
                    });
                    resent += 1;
                }
                if *next_resend > entry.next_resend {
                    *next_resend = entry.next_resend;
                }
            }

            for key in collect {
                state.entries.remove(key);
            }
            failed
                .into_iter()
                .map(|key| state.entries.remove(key))
                .collect()
        };

        let mut first_error = None;
        for mut entry in failed {
            tracing::warn!(
                packet_type = %entry.packet_type,
                full_id = entry.full_id,
                resend_count = entry.resend_count,
                "reliable packet was never acknowledged"
            );
            if let Some(listener) = entry.listener.take() {
                listener(false);
            }
            first_error.get_or_insert(TransportError::ResendBudgetExhausted {
                packet_type: entry.packet_type,
                full_id: entry.full_id,
                resend_count: entry.resend_count,
            });
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(resent),
        }
    }

    /// Drop every entry, fail pending listeners and forget RTT history.
    pub fn reset(&self) {
        let drained: Vec<ResendEntry> = {
            let mut state = self.state.lock();
            state.rtt.reset();
            state.entries.drain().collect()
        };
        for mut entry in drained {
            if let Some(listener) = entry.listener.take() {
                listener(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn mock_retransmitter() -> (Retransmitter, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(1));
        (Retransmitter::with_clock(RetransmitConfig::default(), clock), mock)
    }

    fn listener_into(results: &Arc<Mutex<Vec<bool>>>) -> Option<AckListener> {
        let results = Arc::clone(results);
        Some(Box::new(move |ok| results.lock().push(ok)))
    }

    // ─── RTT Estimator Tests ────────────────────────────────────────────

    #[test]
    fn rtt_first_sample() {
        let mut rtt = RttEstimator::default();
        assert_eq!(rtt.rto(), Duration::from_millis(1000));
        rtt.update(Duration::from_millis(100));
        assert_eq!(rtt.srtt(), Duration::from_millis(100));
        assert_eq!(rtt.rttvar(), Duration::from_millis(50));
        assert_eq!(rtt.rto(), Duration::from_millis(300));
    }

    #[test]
    fn rtt_converges_without_floor() {
        let mut rtt = RttEstimator::new(Duration::from_millis(1000), Duration::ZERO);
        for _ in 0..200 {
            rtt.update(Duration::from_millis(100));
        }
        let rto = rtt.rto();
        assert!(rto >= Duration::from_millis(100));
        assert!(rto < Duration::from_millis(101), "rto {rto:?}");
    }

    #[test]
    fn rtt_floor_applies_after_first_sample() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(20));
        assert_eq!(rtt.rto(), Duration::from_millis(60));
        for _ in 0..100 {
            rtt.update(Duration::from_millis(20));
        }
        assert_eq!(rtt.rto(), Duration::from_millis(200));
    }

    #[test]
    fn rtt_reset() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(40));
        rtt.reset();
        assert!(!rtt.has_sample());
        assert_eq!(rtt.rto(), Duration::from_millis(1000));
    }

    // ─── Retransmitter Tests ────────────────────────────────────────────

    #[test]
    fn resend_after_rto() {
        let (rt, mock) = mock_retransmitter();
        rt.process_packet(PacketType::Command, 5, Bytes::from_static(b"five"), None);

        let mut out = Vec::new();
        let mut next = rt.now() + Duration::from_secs(60);
        assert_eq!(rt.execute_resend(rt.now(), &mut next, &mut out), Ok(0));
        assert!(out.is_empty());
        assert_eq!(next, rt.now() + Duration::from_millis(1000));

        mock.increment(Duration::from_millis(1000));
        assert_eq!(rt.execute_resend(rt.now(), &mut next, &mut out), Ok(1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].full_id, 5);
        assert_eq!(out[0].resend_count, 1);
        assert_eq!(out[0].datagram, Bytes::from_static(b"five"));
    }

    #[test]
    fn resend_spacing_is_capped() {
        let (rt, mock) = mock_retransmitter();
        rt.process_packet(PacketType::Command, 1, Bytes::new(), None);
        mock.increment(Duration::from_millis(1000));

        let mut out = Vec::new();
        let mut next = rt.now() + Duration::from_secs(60);
        rt.execute_resend(rt.now(), &mut next, &mut out).unwrap();
        // rto is still the initial 1000 ms, below the 1500 ms cap
        assert_eq!(next, rt.now() + Duration::from_millis(1000));
    }

    #[test]
    fn acknowledge_unknown_id_is_noop() {
        let (rt, _mock) = mock_retransmitter();
        rt.process_packet(PacketType::Command, 1, Bytes::new(), None);
        assert!(!rt.process_acknowledge(PacketType::Ack, 2));
        assert!(!rt.process_acknowledge(PacketType::AckLow, 1));
        assert_eq!(rt.awaiting_acknowledge(), 1);
        assert_eq!(rt.current_rto(), Duration::from_millis(1000));
    }

    #[test]
    fn acknowledge_feeds_rtt_and_listener() {
        let (rt, mock) = mock_retransmitter();
        let results = Arc::new(Mutex::new(Vec::new()));
        rt.process_packet(PacketType::CommandLow, 0x1_0007, Bytes::new(), listener_into(&results));

        mock.increment(Duration::from_millis(80));
        assert!(rt.process_acknowledge(PacketType::AckLow, 7));
        assert_eq!(*results.lock(), vec![true]);
        assert_eq!(rt.awaiting_acknowledge(), 0);
        assert_eq!(rt.current_rto(), Duration::from_millis(240));
    }

    #[test]
    fn resent_packet_does_not_sample_rtt() {
        let (rt, mock) = mock_retransmitter();
        rt.process_packet(PacketType::Command, 3, Bytes::new(), None);
        mock.increment(Duration::from_millis(1000));

        let mut out = Vec::new();
        let mut next = rt.now();
        rt.execute_resend(rt.now(), &mut next, &mut out).unwrap();

        // two copies in flight: the first ack leaves the entry lingering
        assert!(rt.process_acknowledge(PacketType::Ack, 3));
        assert_eq!(rt.awaiting_acknowledge(), 1);
        assert!(rt.process_acknowledge(PacketType::Ack, 3));
        assert_eq!(rt.awaiting_acknowledge(), 0);
        assert!(!rt.rtt_estimator().has_sample());
    }

    #[test]
    fn acknowledged_entries_are_collected_after_linger() {
        let (rt, mock) = mock_retransmitter();
        rt.process_packet(PacketType::Command, 3, Bytes::new(), None);
        mock.increment(Duration::from_millis(1000));
        let mut out = Vec::new();
        let mut next = rt.now();
        rt.execute_resend(rt.now(), &mut next, &mut out).unwrap();
        assert!(rt.process_acknowledge(PacketType::Ack, 3));
        assert_eq!(rt.awaiting_acknowledge(), 1);

        out.clear();
        // next_resend = t + 1000; linger = 4 * 1000
        mock.increment(Duration::from_millis(4999));
        rt.execute_resend(rt.now(), &mut next, &mut out).unwrap();
        assert_eq!(rt.awaiting_acknowledge(), 1);
        assert!(out.is_empty());

        mock.increment(Duration::from_millis(1));
        rt.execute_resend(rt.now(), &mut next, &mut out).unwrap();
        assert_eq!(rt.awaiting_acknowledge(), 0);
    }

    #[test]
    fn budget_exhaustion_fails_packet() {
        let (rt, mock) = mock_retransmitter();
        let results = Arc::new(Mutex::new(Vec::new()));
        rt.process_packet(PacketType::Command, 9, Bytes::new(), listener_into(&results));

        let mut out = Vec::new();
        let mut outcome = Ok(0);
        for _ in 0..40 {
            mock.increment(Duration::from_millis(1000));
            let mut next = rt.now() + Duration::from_secs(60);
            outcome = rt.execute_resend(rt.now(), &mut next, &mut out);
            if outcome.is_err() {
                break;
            }
        }

        assert_eq!(
            outcome,
            Err(TransportError::ResendBudgetExhausted {
                packet_type: PacketType::Command,
                full_id: 9,
                resend_count: 16,
            })
        );
        assert_eq!(out.len(), 16);
        assert_eq!(*results.lock(), vec![false]);
        assert_eq!(rt.awaiting_acknowledge(), 0);
    }

    #[test]
    fn reset_fails_pending_listeners() {
        let (rt, _mock) = mock_retransmitter();
        let calls = Arc::new(AtomicUsize::new(0));
        for id in 0..3 {
            let calls = Arc::clone(&calls);
            rt.process_packet(
                PacketType::Command,
                id,
                Bytes::new(),
                Some(Box::new(move |ok| {
                    assert!(!ok);
                    calls.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        rt.reset();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(rt.awaiting_acknowledge(), 0);
    }

    #[test]
    fn acknowledge_and_resend_on_separate_threads() {
        const COMMANDS: u32 = 1000;
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(1));
        let rt = Arc::new(Retransmitter::with_clock(RetransmitConfig::default(), clock));
        let fired = Arc::new(Mutex::new(Vec::new()));
        for id in 0..COMMANDS {
            let fired = Arc::clone(&fired);
            rt.process_packet(
                PacketType::Command,
                id,
                Bytes::new(),
                Some(Box::new(move |ok| fired.lock().push((id, ok)))),
            );
        }
        // every entry is due, so the timer thread resends while acks arrive
        mock.increment(Duration::from_millis(1000));

        let receiver = {
            let rt = Arc::clone(&rt);
            std::thread::spawn(move || {
                (0..COMMANDS)
                    .filter(|&id| rt.process_acknowledge(PacketType::Ack, id as u16))
                    .count()
            })
        };

        let mut out = Vec::new();
        let mut resent = 0;
        while !receiver.is_finished() {
            let mut next = rt.now() + Duration::from_secs(60);
            resent += rt.execute_resend(rt.now(), &mut next, &mut out).unwrap();
            out.clear();
            std::thread::yield_now();
        }
        assert_eq!(receiver.join().unwrap(), COMMANDS as usize);
        assert!(resent <= COMMANDS as usize);

        let mut fired = std::mem::take(&mut *fired.lock());
        fired.sort_unstable();
        assert_eq!(fired, (0..COMMANDS).map(|id| (id, true)).collect::<Vec<_>>());

        // resent copies linger until their second ack or the linger period
        mock.increment(Duration::from_secs(60));
        let mut next = rt.now();
        assert_eq!(rt.execute_resend(rt.now(), &mut next, &mut out), Ok(0));
        assert!(out.is_empty());
        assert_eq!(rt.awaiting_acknowledge(), 0);
    }

    #[test]
    fn listener_may_reenter() {
        let (clock, _mock) = Clock::mock();
        let rt = Arc::new(Retransmitter::with_clock(RetransmitConfig::default(), clock));
        let inner = Arc::clone(&rt);
        rt.process_packet(
            PacketType::Command,
            1,
            Bytes::new(),
            Some(Box::new(move |_| {
                inner.process_packet(PacketType::Command, 2, Bytes::new(), None);
            })),
        );
        assert!(rt.process_acknowledge(PacketType::Ack, 1));
        assert_eq!(rt.awaiting_acknowledge(), 1);
    }
}
