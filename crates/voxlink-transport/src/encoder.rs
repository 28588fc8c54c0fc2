//! # Packet Encoder
//!
//! Send path for one connection. No I/O: datagrams are built, encrypted and
//! queued; the owner's send primitive drains them with
//! [`PacketEncoder::pop_write_buffer`].
//!
//! ## Responsibilities
//!
//! 1. **Ids**: one monotonically increasing full id per packet type
//! 2. **Commands**: compress when worthwhile, fragment, register every
//!    fragment with the [`Retransmitter`]
//! 3. **Crypto**: default key before the handshake, derived keys after it,
//!    session MAC for unencrypted packets
//! 4. **Resends**: re-queue due datagrams on the periodic tick
//!
//! Datagrams are [`Bytes`], so the write queue and the retransmitter share
//! one encrypted copy.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use quanta::{Clock, Instant};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use crate::arq::{AckListener, RetransmitConfig, Retransmitter};
use crate::compression;
use crate::config::TransportConfig;
use crate::crypto::{PacketCipher, DEFAULT_KEY, DEFAULT_NONCE};
use crate::error::TransportError;
use crate::generation::PacketIdManager;
use crate::statistics::PacketStatistics;
use crate::wire::{encode_header, Origin, PacketFlags, PacketType, MAC_SIZE};

pub struct PacketEncoder {
    /// Origin written into outgoing headers.
    origin: Origin,
    client_id: AtomicU16,
    cipher: Arc<PacketCipher>,
    statistics: Arc<PacketStatistics>,
    ids: Mutex<PacketIdManager>,
    retransmitter: Retransmitter,
    write_queue: Mutex<VecDeque<Bytes>>,
    compression_threshold: usize,
    max_fragment_payload: usize,
}

impl PacketEncoder {
    pub fn new(
        origin: Origin,
        cipher: Arc<PacketCipher>,
        statistics: Arc<PacketStatistics>,
        config: &TransportConfig,
    ) -> Self {
        Self::with_clock(origin, cipher, statistics, config, Clock::new())
    }

    pub fn with_clock(
        origin: Origin,
        cipher: Arc<PacketCipher>,
        statistics: Arc<PacketStatistics>,
        config: &TransportConfig,
        clock: Clock,
    ) -> Self {
        PacketEncoder {
            origin,
            client_id: AtomicU16::new(0),
            cipher,
            statistics,
            ids: Mutex::new(PacketIdManager::new()),
            retransmitter: Retransmitter::with_clock(RetransmitConfig::from(config), clock),
            write_queue: Mutex::new(VecDeque::new()),
            compression_threshold: config.compression_threshold,
            max_fragment_payload: config.max_fragment_payload.max(1),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Client id written into client-originated headers.
    pub fn set_client_id(&self, client_id: u16) {
        self.client_id.store(client_id, Ordering::Relaxed);
    }

    pub fn retransmitter(&self) -> &Retransmitter {
        &self.retransmitter
    }

    pub fn now(&self) -> Instant {
        self.retransmitter.now()
    }

    // ─── Datagram Construction ──────────────────────────────────────────

    /// MAC, header and (encrypted) payload of one outgoing datagram.
    fn build_datagram(
        &self,
        packet_type: PacketType,
        flags: PacketFlags,
        full_id: u32,
        payload: &[u8],
    ) -> Result<Bytes, TransportError> {
        let wire_id = (full_id & 0xFFFF) as u16;
        let generation = (full_id >> 16) as u16;
        let header_size = self.origin.header_size();

        let mut buf = BytesMut::with_capacity(MAC_SIZE + header_size + payload.len());
        buf.put_bytes(0, MAC_SIZE);
        encode_header(
            &mut buf,
            self.origin,
            wire_id,
            self.client_id.load(Ordering::Relaxed),
            packet_type,
            flags,
        );
        buf.put_slice(payload);

        let (mac, rest) = buf.split_at_mut(MAC_SIZE);
        if flags.contains(PacketFlags::UNENCRYPTED) {
            mac.copy_from_slice(&self.cipher.session_mac());
        } else {
            let (key, nonce) = if self.cipher.encryption_initialized() {
                self.cipher.generate_key_nonce(
                    self.origin.to_server(),
                    packet_type,
                    wire_id,
                    generation,
                )?
            } else {
                (DEFAULT_KEY, DEFAULT_NONCE)
            };
            let (header, body) = rest.split_at_mut(header_size);
            let tag = PacketCipher::encrypt(header, body, &key, &nonce)?;
            mac.copy_from_slice(&tag);
        }
        Ok(buf.freeze())
    }

    fn enqueue(&self, datagrams: impl IntoIterator<Item = Bytes>) {
        self.write_queue.lock().extend(datagrams);
    }

    // ─── Sending ────────────────────────────────────────────────────────

    /// Send an unreliable packet. Returns its full id.
    pub fn send_packet(
        &self,
        packet_type: PacketType,
        flags: PacketFlags,
        payload: &[u8],
    ) -> Result<u32, TransportError> {
        let (full_id, datagram) = {
            let mut ids = self.ids.lock();
            let full_id = ids.peek_full_id(packet_type);
            let datagram = self.build_datagram(packet_type, flags, full_id, payload)?;
            ids.next_full_id(packet_type);
            (full_id, datagram)
        };
        tracing::trace!(
            packet_type = %packet_type,
            full_id,
            len = payload.len(),
            "packet queued"
        );
        self.enqueue([datagram]);
        Ok(full_id)
    }

    /// Acknowledge a received command.
    pub fn send_acknowledge(
        &self,
        wire_id: u16,
        low_priority: bool,
    ) -> Result<u32, TransportError> {
        let packet_type = if low_priority {
            PacketType::AckLow
        } else {
            PacketType::Ack
        };
        self.send_packet(
            packet_type,
            PacketFlags::UNENCRYPTED | PacketFlags::NEW_PROTOCOL,
            &wire_id.to_be_bytes(),
        )
    }

    /// Send a reliable command, fragmenting as needed. `on_ack` fires once
    /// the last fragment is acknowledged, or with `false` when the command
    /// is given up.
    ///
    /// Returns the full id of the first fragment.
    pub fn send_command(
        &self,
        command: &[u8],
        low_priority: bool,
        on_ack: Option<AckListener>,
    ) -> Result<u32, TransportError> {
        let packet_type = if low_priority {
            PacketType::CommandLow
        } else {
            PacketType::Command
        };

        let mut head_flags = PacketFlags::NONE;
        let compressed;
        let data: &[u8] = if command.len() > self.compression_threshold {
            compressed = compression::compress_to_vec(command)?;
            if compressed.len() < command.len() {
                head_flags.insert(PacketFlags::COMPRESSED);
                &compressed
            } else {
                command
            }
        } else {
            command
        };

        let chunks = fragment(data, self.max_fragment_payload);
        let last = chunks.len() - 1;

        // ids, statistics and datagrams in one critical section keep the
        // fragments of one command contiguous. Ids are only taken once every
        // fragment is built, so a failed send leaves no gap at the peer.
        let mut datagrams = Vec::with_capacity(chunks.len());
        let first_full_id = {
            let mut ids = self.ids.lock();
            let first = ids.peek_full_id(packet_type);
            for (index, chunk) in chunks.iter().enumerate() {
                let mut flags = PacketFlags::NEW_PROTOCOL;
                if last > 0 && (index == 0 || index == last) {
                    flags.insert(PacketFlags::FRAGMENTED);
                }
                if index == 0 {
                    flags = flags | head_flags;
                }

                let full_id = first.wrapping_add(index as u32);
                let datagram = self.build_datagram(packet_type, flags, full_id, chunk)?;
                datagrams.push((full_id, datagram));
            }
            for (full_id, _) in &datagrams {
                ids.next_full_id(packet_type);
                self.statistics.send_command(packet_type, *full_id);
            }
            first
        };

        tracing::debug!(
            packet_type = %packet_type,
            first_full_id,
            fragments = datagrams.len(),
            len = command.len(),
            compressed = head_flags.contains(PacketFlags::COMPRESSED),
            "command queued"
        );

        let mut on_ack = on_ack;
        let count = datagrams.len();
        let mut queued = Vec::with_capacity(count);
        for (index, (full_id, datagram)) in datagrams.into_iter().enumerate() {
            let listener = if index + 1 == count { on_ack.take() } else { None };
            self.retransmitter
                .process_packet(packet_type, full_id, datagram.clone(), listener);
            queued.push(datagram);
        }
        self.enqueue(queued);
        Ok(first_full_id)
    }

    /// Next datagram for the socket, oldest first.
    pub fn pop_write_buffer(&self) -> Option<Bytes> {
        self.write_queue.lock().pop_front()
    }

    pub fn pending_writes(&self) -> usize {
        self.write_queue.lock().len()
    }

    // ─── Feedback ───────────────────────────────────────────────────────

    /// An ACK or ACK_LOW for `wire_id` arrived. Returns false when no
    /// command was waiting for it.
    pub fn process_acknowledge(&self, ack_type: PacketType, wire_id: u16) -> bool {
        let matched = self.retransmitter.process_acknowledge(ack_type, wire_id);
        if matched {
            let generation = self.ids.lock().generation(ack_type.acknowledged_type());
            self.statistics
                .received_acknowledge(ack_type, ((generation as u32) << 16) | wire_id as u32);
        } else {
            tracing::trace!(
                packet_type = %ack_type,
                wire_id,
                "acknowledge without pending command"
            );
        }
        matched
    }

    /// Queue every due resend and pull `next_resend` forward to the next
    /// deadline. Returns how many datagrams were queued again.
    pub fn execute_resend(
        &self,
        now: Instant,
        next_resend: &mut Instant,
    ) -> Result<usize, TransportError> {
        let mut resends = Vec::new();
        let result = self.retransmitter.execute_resend(now, next_resend, &mut resends);

        if !resends.is_empty() {
            for resend in &resends {
                self.statistics.send_command(resend.packet_type, resend.full_id);
            }
            tracing::debug!(count = resends.len(), "resending commands");
            self.enqueue(resends.into_iter().map(|resend| resend.datagram));
        }
        result
    }

    /// Drop queued datagrams and fail pending listeners. Ids restart at 0.
    pub fn reset(&self) {
        self.retransmitter.reset();
        self.write_queue.lock().clear();
        self.ids.lock().reset();
    }
}

/// Split `data` into evenly sized chunks of at most `max` bytes. Always at
/// least one chunk.
fn fragment(data: &[u8], max: usize) -> Vec<&[u8]> {
    if data.len() <= max {
        return vec![data];
    }
    let count = data.len().div_ceil(max);
    let size = data.len().div_ceil(count);
    data.chunks(size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Key, KeyDerivation, Nonce};
    use crate::error::CryptoError;
    use crate::wire::Datagram;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn encoder_with(
        origin: Origin,
        config: &TransportConfig,
    ) -> (PacketEncoder, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(1));
        let enc = PacketEncoder::with_clock(
            origin,
            Arc::new(PacketCipher::new()),
            Arc::new(PacketStatistics::default()),
            config,
            clock,
        );
        (enc, mock)
    }

    fn server_encoder() -> (PacketEncoder, Arc<quanta::Mock>) {
        encoder_with(Origin::Server, &TransportConfig::default())
    }

    fn drain(enc: &PacketEncoder) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| enc.pop_write_buffer()).map(|b| b.to_vec()).collect()
    }

    #[test]
    fn fragment_sizes_are_even() {
        let data = vec![0u8; 1000];
        let chunks = fragment(&data, 487);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![334, 334, 332]);
        assert_eq!(fragment(&[], 487).len(), 1);
        assert_eq!(fragment(&data[..487], 487).len(), 1);
    }

    #[test]
    fn acknowledge_is_unencrypted_with_session_mac() {
        let (enc, _mock) = server_encoder();
        enc.send_acknowledge(0x1234, true).unwrap();
        let mut raw = enc.pop_write_buffer().unwrap().to_vec();
        let dg = Datagram::parse(&mut raw, Origin::Server).unwrap();
        assert_eq!(dg.packet_type(), PacketType::AckLow);
        assert!(dg.has_flag(PacketFlags::UNENCRYPTED));
        assert_eq!(dg.mac(), b"TS3INIT1");
        assert_eq!(dg.payload(), &[0x12, 0x34]);
    }

    #[test]
    fn packet_ids_are_per_type() {
        let (enc, _mock) = server_encoder();
        assert_eq!(enc.send_packet(PacketType::Voice, PacketFlags::NONE, b"a").unwrap(), 0);
        assert_eq!(enc.send_packet(PacketType::Voice, PacketFlags::NONE, b"b").unwrap(), 1);
        assert_eq!(enc.send_packet(PacketType::Ping, PacketFlags::UNENCRYPTED, b"").unwrap(), 0);
        assert_eq!(enc.pending_writes(), 3);
    }

    #[test]
    fn encrypted_packet_uses_default_key_before_handshake() {
        let (enc, _mock) = server_encoder();
        enc.send_packet(PacketType::Command, PacketFlags::NONE, b"initivexpand2").unwrap();
        let mut raw = enc.pop_write_buffer().unwrap().to_vec();
        let mut dg = Datagram::parse(&mut raw, Origin::Server).unwrap();
        let (mac, header, payload) = dg.split_mut();
        PacketCipher::decrypt(header, payload, mac, &DEFAULT_KEY, &DEFAULT_NONCE).unwrap();
        assert_eq!(dg.payload(), b"initivexpand2");
    }

    #[test]
    fn encrypted_packet_uses_derived_key_after_handshake() {
        let (enc, _mock) = server_encoder();
        enc.cipher.install_shared_iv(&[9; 64]).unwrap();
        enc.send_packet(PacketType::Voice, PacketFlags::NONE, b"opus").unwrap();

        let mut raw = enc.pop_write_buffer().unwrap().to_vec();
        let mut dg = Datagram::parse(&mut raw, Origin::Server).unwrap();
        let (key, nonce) = enc.cipher.generate_key_nonce(false, PacketType::Voice, 0, 0).unwrap();
        let (mac, header, payload) = dg.split_mut();
        PacketCipher::decrypt(header, payload, mac, &key, &nonce).unwrap();
        assert_eq!(dg.payload(), b"opus");
    }

    #[test]
    fn client_header_carries_client_id() {
        let (enc, _mock) = encoder_with(Origin::Client, &TransportConfig::default());
        enc.set_client_id(77);
        enc.send_packet(PacketType::Ping, PacketFlags::UNENCRYPTED, b"").unwrap();
        let mut raw = enc.pop_write_buffer().unwrap().to_vec();
        let dg = Datagram::parse(&mut raw, Origin::Client).unwrap();
        assert_eq!(dg.client_id(), 77);
    }

    #[test]
    fn small_command_is_single_unfragmented_packet() {
        let (enc, _mock) = server_encoder();
        assert_eq!(enc.send_command(b"clientupdate", false, None).unwrap(), 0);
        let mut out = drain(&enc);
        assert_eq!(out.len(), 1);
        let dg = Datagram::parse(&mut out[0], Origin::Server).unwrap();
        assert!(!dg.has_flag(PacketFlags::FRAGMENTED));
        assert!(!dg.has_flag(PacketFlags::COMPRESSED));
        assert!(dg.has_flag(PacketFlags::NEW_PROTOCOL));
        assert_eq!(enc.retransmitter().awaiting_acknowledge(), 1);
    }

    #[test]
    fn large_command_is_fragmented_and_flagged() {
        let config = TransportConfig {
            compression_threshold: usize::MAX,
            ..TransportConfig::default()
        };
        let (enc, _mock) = encoder_with(Origin::Server, &config);
        let command: Vec<u8> = (0..1200u32).map(|i| (i * 7 % 251) as u8).collect();
        enc.send_command(&command, true, None).unwrap();

        let mut out = drain(&enc);
        assert_eq!(out.len(), 3);
        let flags: Vec<bool> = out
            .iter_mut()
            .map(|raw| {
                let dg = Datagram::parse(raw, Origin::Server).unwrap();
                assert_eq!(dg.packet_type(), PacketType::CommandLow);
                dg.has_flag(PacketFlags::FRAGMENTED)
            })
            .collect();
        assert_eq!(flags, vec![true, false, true]);
        assert_eq!(enc.retransmitter().awaiting_acknowledge(), 3);
        assert_eq!(enc.statistics.counters(PacketType::CommandLow).unwrap().lost, 0);
    }

    #[test]
    fn compressible_command_is_compressed() {
        let (enc, _mock) = server_encoder();
        let command = b"notifyservergrouplist sgid=6 name=Server\\sAdmin type=1 ".repeat(40);
        enc.send_command(&command, false, None).unwrap();
        let mut out = drain(&enc);
        assert!(out.len() < command.len().div_ceil(487));
        let dg = Datagram::parse(&mut out[0], Origin::Server).unwrap();
        assert!(dg.has_flag(PacketFlags::COMPRESSED));
    }

    #[test]
    fn listener_fires_on_last_fragment_ack() {
        let config = TransportConfig {
            compression_threshold: usize::MAX,
            ..TransportConfig::default()
        };
        let (enc, _mock) = encoder_with(Origin::Server, &config);
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        enc.send_command(&[b'x'; 600], false, Some(Box::new(move |ok| sink.lock().push(ok))))
            .unwrap();

        assert!(enc.process_acknowledge(PacketType::Ack, 0));
        assert!(results.lock().is_empty());
        assert!(enc.process_acknowledge(PacketType::Ack, 1));
        assert_eq!(*results.lock(), vec![true]);
        assert!(!enc.process_acknowledge(PacketType::Ack, 1));
        assert_eq!(enc.statistics.counters(PacketType::Command).unwrap().received, 2);
    }

    #[test]
    fn resend_requeues_same_datagram() {
        let (enc, mock) = server_encoder();
        enc.send_command(b"clientinit", false, None).unwrap();
        let first = enc.pop_write_buffer().unwrap();

        let mut next = enc.now() + Duration::from_secs(60);
        assert_eq!(enc.execute_resend(enc.now(), &mut next), Ok(0));
        mock.increment(Duration::from_millis(1000));
        assert_eq!(enc.execute_resend(enc.now(), &mut next), Ok(1));
        assert_eq!(enc.pop_write_buffer().unwrap(), first);
    }

    #[test]
    fn reset_clears_queue_and_fails_listeners() {
        let (enc, _mock) = server_encoder();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        enc.send_command(b"x", false, Some(Box::new(move |ok| sink.lock().push(ok))))
            .unwrap();
        enc.reset();
        assert_eq!(enc.pending_writes(), 0);
        assert_eq!(*results.lock(), vec![false]);
        assert_eq!(enc.send_command(b"y", false, None).unwrap(), 0);
    }

    /// Derivation that fails while `broken` is set.
    struct Switchable {
        broken: Arc<AtomicBool>,
    }

    impl KeyDerivation for Switchable {
        fn derive(
            &self,
            _: &[u8],
            _: bool,
            packet_type: PacketType,
            generation: u16,
        ) -> Result<(Key, Nonce), CryptoError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(CryptoError::KeyGeneration(packet_type.as_u8()));
            }
            Ok(([generation as u8; 16], [0x5A; 16]))
        }
    }

    #[test]
    fn failed_send_consumes_no_ids() {
        let broken = Arc::new(AtomicBool::new(true));
        let cipher = PacketCipher::with_derivation(Box::new(Switchable {
            broken: Arc::clone(&broken),
        }));
        cipher.install_shared_iv(&[3; 64]).unwrap();
        let (clock, _mock) = Clock::mock();
        let statistics = Arc::new(PacketStatistics::default());
        let config = TransportConfig {
            compression_threshold: usize::MAX,
            ..TransportConfig::default()
        };
        let enc = PacketEncoder::with_clock(
            Origin::Server,
            Arc::new(cipher),
            Arc::clone(&statistics),
            &config,
            clock,
        );

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let err = enc
            .send_command(&[b'f'; 1200], false, Some(Box::new(move |ok| sink.lock().push(ok))))
            .unwrap_err();
        assert!(matches!(err, TransportError::Encrypt(CryptoError::KeyGeneration(_))));
        assert!(enc.send_packet(PacketType::Voice, PacketFlags::NONE, b"v").is_err());
        assert_eq!(enc.pending_writes(), 0);
        assert_eq!(enc.retransmitter().awaiting_acknowledge(), 0);
        assert_eq!(statistics.unconfirmed_commands(PacketType::Command), 0);

        broken.store(false, Ordering::SeqCst);
        assert_eq!(enc.send_command(&[b'f'; 1200], false, None).unwrap(), 0);
        assert_eq!(enc.send_packet(PacketType::Voice, PacketFlags::NONE, b"v").unwrap(), 0);
        assert_eq!(enc.pending_writes(), 4);
        assert_eq!(enc.retransmitter().awaiting_acknowledge(), 3);
        assert_eq!(statistics.unconfirmed_commands(PacketType::Command), 3);
    }
}
