//! # Packet Statistics
//!
//! Per-connection loss accounting across traffic classes, behind one lock.
//! Receive-side trackers watch voice, ping and ack ids; the send-side
//! command trackers are fed from the encoder and from received acks.

use parking_lot::Mutex;
use quanta::Instant;
use serde::Serialize;
use std::time::Duration;

use crate::loss::{LossCounters, OrderedLossTracker, UnorderedLossTracker};
use crate::wire::PacketType;

// ─── Loss Report ────────────────────────────────────────────────────────────

/// Short-window loss per class, suitable for a connection info response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LossReport {
    pub received_voice: u32,
    pub lost_voice: u32,
    pub received_keep_alive: u32,
    pub lost_keep_alive: u32,
    /// Acknowledged commands plus received acks.
    pub received_control: u32,
    pub lost_control: u32,
}

fn ratio(lost: u32, received: u32) -> f32 {
    let total = lost as u64 + received as u64;
    if total == 0 {
        0.0
    } else {
        lost as f32 / total as f32
    }
}

impl LossReport {
    pub fn voice_loss(&self) -> f32 {
        ratio(self.lost_voice, self.received_voice)
    }

    pub fn keep_alive_loss(&self) -> f32 {
        ratio(self.lost_keep_alive, self.received_keep_alive)
    }

    pub fn control_loss(&self) -> f32 {
        ratio(self.lost_control, self.received_control)
    }

    pub fn total_loss(&self) -> f32 {
        ratio(
            self.lost_voice + self.lost_keep_alive + self.lost_control,
            self.received_voice + self.received_keep_alive + self.received_control,
        )
    }
}

// ─── Packet Statistics ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Trackers {
    voice: UnorderedLossTracker,
    voice_whisper: UnorderedLossTracker,
    ping: UnorderedLossTracker,
    ack: UnorderedLossTracker,
    ack_low: UnorderedLossTracker,
    command: OrderedLossTracker,
    command_low: OrderedLossTracker,
    /// Last short-window decay; `None` until the first tick.
    last_short: Option<Instant>,
}

impl Trackers {
    fn unordered_mut(&mut self) -> [&mut UnorderedLossTracker; 5] {
        [
            &mut self.voice,
            &mut self.voice_whisper,
            &mut self.ping,
            &mut self.ack,
            &mut self.ack_low,
        ]
    }
}

pub struct PacketStatistics {
    trackers: Mutex<Trackers>,
    interval: Duration,
}

impl Default for PacketStatistics {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

impl PacketStatistics {
    pub fn new(interval: Duration) -> Self {
        PacketStatistics {
            trackers: Mutex::new(Trackers::default()),
            interval,
        }
    }

    /// A datagram of `packet_type` arrived. Commands are accounted on the
    /// sending side and ignored here.
    pub fn received_packet(&self, packet_type: PacketType, full_id: u32) {
        let mut t = self.trackers.lock();
        match packet_type {
            PacketType::Voice => t.voice.packet_received(full_id),
            PacketType::VoiceWhisper => t.voice_whisper.packet_received(full_id),
            PacketType::Ping => t.ping.packet_received(full_id),
            PacketType::Ack => t.ack.packet_received(full_id),
            PacketType::AckLow => t.ack_low.packet_received(full_id),
            _ => {}
        }
    }

    pub fn send_command(&self, packet_type: PacketType, full_id: u32) {
        let mut t = self.trackers.lock();
        match packet_type {
            PacketType::Command => t.command.packet_send(full_id),
            PacketType::CommandLow => t.command_low.packet_send(full_id),
            _ => {}
        }
    }

    /// `ack_type` is ACK or ACK_LOW; `id` is the acknowledged command id.
    pub fn received_acknowledge(&self, ack_type: PacketType, id: u32) {
        let mut t = self.trackers.lock();
        match ack_type {
            PacketType::Ack => t.command.ack_received(id),
            PacketType::AckLow => t.command_low.ack_received(id),
            _ => {}
        }
    }

    /// Decay the short windows once per interval. Returns whether it did.
    pub fn tick(&self, now: Instant) -> bool {
        let mut t = self.trackers.lock();
        match t.last_short {
            Some(at) if now < at + self.interval => return false,
            None => {
                t.last_short = Some(now);
                return false;
            }
            _ => t.last_short = Some(now),
        }

        t.command.short_stats();
        t.command_low.short_stats();
        for tracker in t.unordered_mut() {
            tracker.short_stats();
        }
        true
    }

    pub fn loss_report(&self) -> LossReport {
        let t = self.trackers.lock();
        let voice = t.voice.counters();
        let whisper = t.voice_whisper.counters();
        let ping = t.ping.counters();
        let command = t.command.counters();
        let command_low = t.command_low.counters();
        let ack = t.ack.counters();
        let ack_low = t.ack_low.counters();

        LossReport {
            received_voice: voice.received + whisper.received,
            lost_voice: voice.lost + whisper.lost,
            received_keep_alive: ping.received,
            lost_keep_alive: ping.lost,
            received_control: command.received
                + command_low.received
                + ack.received
                + ack_low.received,
            lost_control: command.lost + command_low.lost,
        }
    }

    pub fn current_packet_loss(&self) -> f32 {
        self.loss_report().total_loss()
    }

    /// Counters of the tracker behind `packet_type`, if it has one.
    pub fn counters(&self, packet_type: PacketType) -> Option<LossCounters> {
        let t = self.trackers.lock();
        match packet_type {
            PacketType::Voice => Some(t.voice.counters()),
            PacketType::VoiceWhisper => Some(t.voice_whisper.counters()),
            PacketType::Ping => Some(t.ping.counters()),
            PacketType::Ack => Some(t.ack.counters()),
            PacketType::AckLow => Some(t.ack_low.counters()),
            PacketType::Command => Some(t.command.counters()),
            PacketType::CommandLow => Some(t.command_low.counters()),
            _ => None,
        }
    }

    /// Command sends of `packet_type` still waiting for an acknowledgement.
    pub fn unconfirmed_commands(&self, packet_type: PacketType) -> u32 {
        let t = self.trackers.lock();
        match packet_type {
            PacketType::Command => t.command.unconfirmed_lost(),
            PacketType::CommandLow => t.command_low.unconfirmed_lost(),
            _ => 0,
        }
    }

    pub fn reset(&self) {
        let mut t = self.trackers.lock();
        t.command.reset();
        t.command_low.reset();
        for tracker in t.unordered_mut() {
            tracker.reset();
        }
    }

    /// Forget id positions but keep the counts, e.g. after a rekey.
    pub fn reset_offsets(&self) {
        let mut t = self.trackers.lock();
        t.command.reset_offsets();
        t.command_low.reset_offsets();
        for tracker in t.unordered_mut() {
            tracker.reset_offsets();
        }
    }
}
