//! # Connection
//!
//! One peer's transport: shared cipher and statistics, a [`PacketDecoder`]
//! for incoming datagrams and a [`PacketEncoder`] for outgoing ones.
//!
//! Transport-level packets are handled here: ACK/ACK_LOW feed the
//! retransmitter, PING is answered with PONG. Everything else reaches the
//! [`ConnectionHandler`]. Fatal decode errors and resend exhaustion close
//! the connection exactly once.
//!
//! `handle_datagram` and `tick` take `&mut self` because both may call into
//! the handler, so through this facade the receive and timer paths run one
//! at a time. [`PacketDecoder`] and [`PacketEncoder`] are `Sync`; an owner
//! that wants a separate timer thread drives them directly.

use bytes::Bytes;
use quanta::{Clock, Instant};
use std::sync::Arc;
use std::time::Duration;

use crate::arq::AckListener;
use crate::config::TransportConfig;
use crate::crypto::PacketCipher;
use crate::decoder::{DecodeHandler, PacketDecoder};
use crate::encoder::PacketEncoder;
use crate::error::TransportError;
use crate::reorder::ReassembledCommand;
use crate::statistics::PacketStatistics;
use crate::wire::{Datagram, Origin, PacketFlags, PacketType};

/// Upper bound for the resend deadline when nothing is in flight.
const IDLE_RESEND_INTERVAL: Duration = Duration::from_secs(1);

/// Application side of a connection.
pub trait ConnectionHandler {
    /// A complete command. `low_priority` for COMMAND_LOW.
    fn on_command(&mut self, command: &[u8], low_priority: bool);

    /// Voice, whisper, pong and init packets.
    fn on_packet(&mut self, datagram: &Datagram<'_>);

    fn on_disconnect(&mut self, reason: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected(String),
}

pub struct Connection<H: ConnectionHandler> {
    /// This endpoint's role; incoming datagrams carry the opposite origin.
    local: Origin,
    cipher: Arc<PacketCipher>,
    statistics: Arc<PacketStatistics>,
    decoder: PacketDecoder,
    encoder: PacketEncoder,
    handler: H,
    state: ConnectionState,
    next_resend: Option<Instant>,
}

/// Routes decoder output for one datagram.
struct Dispatch<'a, H> {
    decoder: &'a PacketDecoder,
    encoder: &'a PacketEncoder,
    handler: &'a mut H,
    error: Option<TransportError>,
}

impl<H> Dispatch<'_, H> {
    fn record(&mut self, result: Result<u32, TransportError>) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to queue transport reply");
            self.error.get_or_insert(e);
        }
    }
}

impl<H: ConnectionHandler> DecodeHandler for Dispatch<'_, H> {
    fn decoded_command(&mut self, packet_type: PacketType, command: ReassembledCommand) {
        self.handler
            .on_command(command.command(), packet_type == PacketType::CommandLow);
        self.decoder.recycle(command);
    }

    fn decoded_packet(&mut self, datagram: &Datagram<'_>) {
        match datagram.packet_type() {
            PacketType::Ack | PacketType::AckLow => {
                let payload = datagram.payload();
                if payload.len() < 2 {
                    tracing::debug!(wire_id = datagram.wire_id(), "truncated acknowledge");
                    return;
                }
                let acked = u16::from_be_bytes([payload[0], payload[1]]);
                self.encoder.process_acknowledge(datagram.packet_type(), acked);
            }
            PacketType::Ping => {
                let result = self.encoder.send_packet(
                    PacketType::Pong,
                    PacketFlags::UNENCRYPTED,
                    &datagram.wire_id().to_be_bytes(),
                );
                self.record(result);
            }
            _ => self.handler.on_packet(datagram),
        }
    }

    fn send_acknowledge(&mut self, wire_id: u16, low_priority: bool) {
        let result = self.encoder.send_acknowledge(wire_id, low_priority);
        self.record(result);
    }
}

impl<H: ConnectionHandler> Connection<H> {
    pub fn new(local: Origin, config: &TransportConfig, handler: H) -> Self {
        Self::with_clock(local, config, handler, Clock::new())
    }

    pub fn with_clock(local: Origin, config: &TransportConfig, handler: H, clock: Clock) -> Self {
        let cipher = Arc::new(PacketCipher::new());
        let statistics = Arc::new(PacketStatistics::new(config.statistics_interval));
        Connection {
            local,
            decoder: PacketDecoder::new(Arc::clone(&cipher), Arc::clone(&statistics), config),
            encoder: PacketEncoder::with_clock(
                local,
                Arc::clone(&cipher),
                Arc::clone(&statistics),
                config,
                clock,
            ),
            cipher,
            statistics,
            handler,
            state: ConnectionState::Connected,
            next_resend: None,
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn local(&self) -> Origin {
        self.local
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn cipher(&self) -> &Arc<PacketCipher> {
        &self.cipher
    }

    pub fn statistics(&self) -> &Arc<PacketStatistics> {
        &self.statistics
    }

    pub fn decoder(&self) -> &PacketDecoder {
        &self.decoder
    }

    pub fn encoder(&self) -> &PacketEncoder {
        &self.encoder
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Earliest pending resend deadline seen by the last tick.
    pub fn next_resend(&self) -> Option<Instant> {
        self.next_resend
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        match &self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected(reason) => {
                Err(TransportError::ConnectionClosed(reason.clone()))
            }
        }
    }

    // ─── Receive ────────────────────────────────────────────────────────

    /// Parse and decode one datagram from the peer.
    pub fn handle_datagram(&mut self, raw: &mut [u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let mut datagram = Datagram::parse(raw, self.local.opposite())?;

        let mut dispatch = Dispatch {
            decoder: &self.decoder,
            encoder: &self.encoder,
            handler: &mut self.handler,
            error: None,
        };
        let result = self.decoder.process_incoming_data(&mut datagram, &mut dispatch);
        let reply_error = dispatch.error.take();

        match result {
            Ok(()) => match reply_error {
                Some(e) => Err(e),
                None => Ok(()),
            },
            Err(e) if e.is_fatal() => {
                self.disconnect(e.to_string());
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ─── Send ───────────────────────────────────────────────────────────

    pub fn send_command(
        &self,
        command: &[u8],
        low_priority: bool,
        on_ack: Option<AckListener>,
    ) -> Result<u32, TransportError> {
        self.ensure_connected()?;
        self.encoder.send_command(command, low_priority, on_ack)
    }

    pub fn send_packet(
        &self,
        packet_type: PacketType,
        flags: PacketFlags,
        payload: &[u8],
    ) -> Result<u32, TransportError> {
        self.ensure_connected()?;
        self.encoder.send_packet(packet_type, flags, payload)
    }

    pub fn pop_write_buffer(&self) -> Option<Bytes> {
        self.encoder.pop_write_buffer()
    }

    // ─── Timer ──────────────────────────────────────────────────────────

    /// Run due resends and decay loss statistics.
    pub fn tick(&mut self, now: Instant) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.statistics.tick(now);

        let mut next = now + IDLE_RESEND_INTERVAL;
        let result = self.encoder.execute_resend(now, &mut next);
        self.next_resend = Some(next);
        if let Err(e) = result {
            self.disconnect(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Close the connection. Only the first call has an effect.
    pub fn disconnect(&mut self, reason: impl Into<String>) {
        if !self.is_connected() {
            return;
        }
        let reason = reason.into();
        tracing::info!(reason = %reason, local = ?self.local, "connection closed");
        self.state = ConnectionState::Disconnected(reason.clone());
        self.decoder.reset();
        self.encoder.reset();
        self.next_resend = None;
        self.handler.on_disconnect(&reason);
    }

    pub fn register_initiv_packet(&self) {
        self.decoder.register_initiv_packet();
    }

    /// Start over: drop the session secret, reassembly and generation
    /// state, queued datagrams and pending resends. Pending ack listeners
    /// are told `false`. The connection stays open.
    pub fn reset(&mut self) {
        self.cipher.reset();
        self.decoder.reset();
        self.encoder.reset();
        self.next_resend = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        commands: Vec<(Vec<u8>, bool)>,
        packets: Vec<(PacketType, Vec<u8>)>,
        disconnects: Vec<String>,
    }

    impl ConnectionHandler for Recorder {
        fn on_command(&mut self, command: &[u8], low_priority: bool) {
            self.commands.push((command.to_vec(), low_priority));
        }

        fn on_packet(&mut self, datagram: &Datagram<'_>) {
            self.packets
                .push((datagram.packet_type(), datagram.payload().to_vec()));
        }

        fn on_disconnect(&mut self, reason: &str) {
            self.disconnects.push(reason.to_string());
        }
    }

    fn pair() -> (Connection<Recorder>, Connection<Recorder>, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(1));
        let config = TransportConfig::default();
        let server =
            Connection::with_clock(Origin::Server, &config, Recorder::default(), clock.clone());
        let client = Connection::with_clock(Origin::Client, &config, Recorder::default(), clock);
        (server, client, mock)
    }

    /// Move every queued datagram from `from` into `to`, ignoring
    /// per-packet errors.
    fn pump(from: &Connection<Recorder>, to: &mut Connection<Recorder>) -> usize {
        let mut n = 0;
        while let Some(datagram) = from.pop_write_buffer() {
            let _ = to.handle_datagram(&mut datagram.to_vec());
            n += 1;
        }
        n
    }

    #[test]
    fn command_roundtrip_and_ack() {
        let (mut server, mut client, _mock) = pair();
        client.send_command(b"clientinit client_nickname=bob", false, None).unwrap();
        assert_eq!(client.encoder().retransmitter().awaiting_acknowledge(), 1);

        assert_eq!(pump(&client, &mut server), 1);
        assert_eq!(
            server.handler().commands,
            vec![(b"clientinit client_nickname=bob".to_vec(), false)]
        );

        // the server queued an ack
        assert_eq!(pump(&server, &mut client), 1);
        assert_eq!(client.encoder().retransmitter().awaiting_acknowledge(), 0);
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let (mut server, mut client, _mock) = pair();
        client
            .send_packet(PacketType::Ping, PacketFlags::UNENCRYPTED, &[])
            .unwrap();
        pump(&client, &mut server);
        assert!(server.handler().packets.is_empty());

        pump(&server, &mut client);
        assert_eq!(client.handler().packets, vec![(PacketType::Pong, vec![0, 0])]);
    }

    #[test]
    fn voice_reaches_handler() {
        let (mut server, mut client, _mock) = pair();
        client.send_packet(PacketType::Voice, PacketFlags::NONE, b"opus").unwrap();
        pump(&client, &mut server);
        assert_eq!(server.handler().packets, vec![(PacketType::Voice, b"opus".to_vec())]);
    }

    #[test]
    fn malformed_datagram_is_rejected() {
        let (mut server, _client, _mock) = pair();
        let err = server.handle_datagram(&mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, TransportError::Wire(_)));
        assert!(server.is_connected());
    }

    #[test]
    fn resend_exhaustion_disconnects_once() {
        let (mut server, _client, mock) = pair();
        let outcome = Arc::new(parking_lot::Mutex::new(None));
        let sink = Arc::clone(&outcome);
        let listener: AckListener = Box::new(move |ok| *sink.lock() = Some(ok));
        server.send_command(b"notifyserverupdated", false, Some(listener)).unwrap();

        let mut result = Ok(());
        for _ in 0..40 {
            mock.increment(Duration::from_millis(1500));
            result = server.tick(server.encoder().now());
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(TransportError::ResendBudgetExhausted { .. })));
        assert_eq!(*outcome.lock(), Some(false));
        assert_eq!(server.handler().disconnects.len(), 1);
        assert!(matches!(server.state(), ConnectionState::Disconnected(_)));

        let err = server.tick(server.encoder().now()).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed(_)));
        assert!(server.handle_datagram(&mut [0u8; 16]).is_err());
        server.disconnect("again");
        assert_eq!(server.handler().disconnects.len(), 1);
    }

    #[test]
    fn fatal_decode_error_disconnects() {
        let config = TransportConfig {
            reorder_capacity: 2,
            ..TransportConfig::default()
        };
        let (clock, _mock) = Clock::mock();
        let mut server =
            Connection::with_clock(Origin::Server, &config, Recorder::default(), clock.clone());
        let client_config = TransportConfig {
            compression_threshold: usize::MAX,
            ..TransportConfig::default()
        };
        let client =
            Connection::with_clock(Origin::Client, &client_config, Recorder::default(), clock);

        // three fragments never fit a two-slot buffer
        client.send_command(&[b'a'; 1200], false, None).unwrap();
        let mut last = Ok(());
        while let Some(datagram) = client.pop_write_buffer() {
            last = server.handle_datagram(&mut datagram.to_vec());
        }
        assert!(last.is_err());
        assert_eq!(server.handler().disconnects.len(), 1);
        assert!(server.handler().disconnects[0].contains("sequence too long"));
    }

    #[test]
    fn reset_cancels_pending_sends() {
        let (mut server, mut client, _mock) = pair();
        server.cipher().install_shared_iv(&[7; 64]).unwrap();
        let outcome = Arc::new(parking_lot::Mutex::new(None));
        let sink = Arc::clone(&outcome);
        let listener: AckListener = Box::new(move |ok| *sink.lock() = Some(ok));
        server.send_command(b"notifyclientmoved", false, Some(listener)).unwrap();
        assert_eq!(server.encoder().retransmitter().awaiting_acknowledge(), 1);

        server.reset();
        assert_eq!(*outcome.lock(), Some(false));
        assert_eq!(server.encoder().retransmitter().awaiting_acknowledge(), 0);
        assert_eq!(server.encoder().pending_writes(), 0);
        assert!(!server.cipher().encryption_initialized());
        assert!(server.next_resend().is_none());
        assert!(server.is_connected());
        assert!(server.handler().disconnects.is_empty());

        // ids restart and the default key is back in use
        assert_eq!(server.send_command(b"initserver", false, None).unwrap(), 0);
        pump(&server, &mut client);
        assert_eq!(client.handler().commands, vec![(b"initserver".to_vec(), false)]);
    }

    #[test]
    fn pipelines_are_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PacketDecoder>();
        assert_send_sync::<PacketEncoder>();
        assert_send_sync::<PacketCipher>();
        assert_send_sync::<PacketStatistics>();
    }

    #[test]
    fn register_initiv_skips_first_command() {
        let (mut server, mut client, _mock) = pair();
        server.register_initiv_packet();
        client.send_command(b"clientinitiv alpha=x", false, None).unwrap();
        client.send_command(b"clientinit", false, None).unwrap();
        pump(&client, &mut server);
        assert_eq!(server.handler().commands, vec![(b"clientinit".to_vec(), false)]);
    }
}
