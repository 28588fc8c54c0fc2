//! # Packet Decoder
//!
//! Receive pipeline for one connection. No I/O: the caller parses a
//! datagram and hands it in together with a [`DecodeHandler`].
//!
//! ## Pipeline
//!
//! 1. **Generation**: the per-type estimator extends the wire id
//! 2. **Decrypt**: unless flagged unencrypted, in place
//! 3. **Commands**: insert into the type's reorder buffer, acknowledge, then
//!    reassemble and dispatch every complete command
//! 4. **Everything else**: dispatch directly and feed the loss statistics
//!
//! Calls for the same connection must not overlap; different connections
//! decode in parallel. The reorder lock is held for insert and for taking
//! fragments out, never across decompression or handler calls.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::TransportConfig;
use crate::crypto::{Key, Nonce, PacketCipher, DEFAULT_KEY, DEFAULT_NONCE};
use crate::error::DecodeError;
use crate::generation::GenerationEstimator;
use crate::pool::BufferPool;
use crate::reorder::{
    CommandFragment, InsertResult, ReassembleResult, ReassembledCommand, ReorderBuffer,
    TakeResult,
};
use crate::statistics::PacketStatistics;
use crate::wire::{Datagram, PacketFlags, PacketType};

/// Ids below this in generation 0 may still be handshake packets encrypted
/// with the default key.
const HANDSHAKE_ID_LIMIT: u16 = 10;

// ─── Handler ────────────────────────────────────────────────────────────────

/// Receives the decoder's output.
pub trait DecodeHandler {
    /// A complete command of type COMMAND or COMMAND_LOW. Hand the command
    /// back through [`PacketDecoder::recycle`] to reuse its buffer.
    fn decoded_command(&mut self, packet_type: PacketType, command: ReassembledCommand);

    /// Any other decrypted datagram.
    fn decoded_packet(&mut self, datagram: &Datagram<'_>);

    /// A command with `wire_id` must be acknowledged to the peer.
    fn send_acknowledge(&mut self, wire_id: u16, low_priority: bool);
}

// ─── Decoder ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    Default,
    Derived,
}

pub struct PacketDecoder {
    cipher: Arc<PacketCipher>,
    statistics: Arc<PacketStatistics>,
    estimators: Mutex<[GenerationEstimator; PacketType::COUNT]>,
    /// COMMAND at index 0, COMMAND_LOW at index 1.
    command_buffers: [Mutex<ReorderBuffer>; 2],
    pool: BufferPool,
    max_command_size: usize,
    acknowledge_overflow: bool,
}

fn command_buffer_index(packet_type: PacketType) -> usize {
    match packet_type {
        PacketType::CommandLow => 1,
        _ => 0,
    }
}

impl PacketDecoder {
    pub fn new(
        cipher: Arc<PacketCipher>,
        statistics: Arc<PacketStatistics>,
        config: &TransportConfig,
    ) -> Self {
        let window = config.generation_window;
        PacketDecoder {
            cipher,
            statistics,
            estimators: Mutex::new(std::array::from_fn(|_| GenerationEstimator::new(window))),
            command_buffers: [
                Mutex::new(ReorderBuffer::new(config.reorder_capacity)),
                Mutex::new(ReorderBuffer::new(config.reorder_capacity)),
            ],
            pool: BufferPool::new(config.buffer_pool_capacity),
            max_command_size: config.max_command_size,
            acknowledge_overflow: config.acknowledge_overflow,
        }
    }

    pub fn cipher(&self) -> &Arc<PacketCipher> {
        &self.cipher
    }

    /// Decode one datagram and dispatch its content to `handler`.
    pub fn process_incoming_data<H: DecodeHandler + ?Sized>(
        &self,
        datagram: &mut Datagram<'_>,
        handler: &mut H,
    ) -> Result<(), DecodeError> {
        let packet_type = datagram.packet_type();
        let generation =
            self.estimators.lock()[packet_type.index()].visit_packet(datagram.wire_id());
        datagram.set_generation(generation);

        self.decrypt_incoming(datagram)?;

        tracing::trace!(
            packet_type = %packet_type,
            wire_id = datagram.wire_id(),
            generation,
            len = datagram.payload().len(),
            "datagram decrypted"
        );

        if packet_type.is_command() {
            self.process_command(datagram, handler)
        } else {
            handler.decoded_packet(datagram);
            self.statistics.received_packet(packet_type, datagram.full_id());
            Ok(())
        }
    }

    // ─── Decryption ─────────────────────────────────────────────────────

    fn decrypt_incoming(&self, datagram: &mut Datagram<'_>) -> Result<(), DecodeError> {
        if datagram.has_flag(PacketFlags::UNENCRYPTED) {
            return Ok(());
        }

        let primary = if self.cipher.encryption_initialized() {
            KeySource::Derived
        } else {
            KeySource::Default
        };
        let handshake_window =
            datagram.wire_id() < HANDSHAKE_ID_LIMIT && datagram.generation() == 0;
        if !handshake_window {
            return self.decrypt_with(datagram, primary, false);
        }

        match self.decrypt_with(datagram, primary, true) {
            Ok(()) => Ok(()),
            Err(err) => {
                // a retransmitted handshake packet may race the key setup
                let fallback = match primary {
                    KeySource::Derived => KeySource::Default,
                    KeySource::Default if self.cipher.encryption_initialized() => {
                        KeySource::Derived
                    }
                    KeySource::Default => return Err(err),
                };
                self.decrypt_with(datagram, fallback, false)
            }
        }
    }

    fn key_for(
        &self,
        datagram: &Datagram<'_>,
        source: KeySource,
    ) -> Result<(Key, Nonce), DecodeError> {
        match source {
            KeySource::Default => Ok((DEFAULT_KEY, DEFAULT_NONCE)),
            KeySource::Derived => self
                .cipher
                .generate_key_nonce(
                    datagram.origin().to_server(),
                    datagram.packet_type(),
                    datagram.wire_id(),
                    datagram.generation(),
                )
                .map_err(|e| {
                    DecodeError::DecryptKeyGenFailed(format!(
                        "pid: {}, gen: {}, {}",
                        datagram.wire_id(),
                        datagram.generation(),
                        e
                    ))
                }),
        }
    }

    /// With `preserve` the payload is only overwritten on success, so a
    /// second attempt sees the original ciphertext.
    fn decrypt_with(
        &self,
        datagram: &mut Datagram<'_>,
        source: KeySource,
        preserve: bool,
    ) -> Result<(), DecodeError> {
        let (key, nonce) = self.key_for(datagram, source)?;
        let (wire_id, generation, packet_type) =
            (datagram.wire_id(), datagram.generation(), datagram.packet_type());

        let (mac, header, payload) = datagram.split_mut();
        let result = if preserve {
            let mut scratch = payload.to_vec();
            let result = PacketCipher::decrypt(header, &mut scratch, mac, &key, &nonce);
            if result.is_ok() {
                payload.copy_from_slice(&scratch);
            }
            result
        } else {
            PacketCipher::decrypt(header, payload, mac, &key, &nonce)
        };

        result.map_err(|e| {
            tracing::debug!(
                packet_type = %packet_type,
                wire_id,
                generation,
                key = ?source,
                "failed to decrypt datagram"
            );
            DecodeError::DecryptFailed(format!(
                "pid: {wire_id}, gen: {generation}, key: {source:?}, {e}"
            ))
        })
    }

    // ─── Commands ───────────────────────────────────────────────────────

    fn process_command<H: DecodeHandler + ?Sized>(
        &self,
        datagram: &Datagram<'_>,
        handler: &mut H,
    ) -> Result<(), DecodeError> {
        let packet_type = datagram.packet_type();
        let low = packet_type == PacketType::CommandLow;
        let buffer = &self.command_buffers[command_buffer_index(packet_type)];

        let fragment = CommandFragment::new(
            datagram.wire_id(),
            datagram.generation(),
            datagram.flags(),
            Bytes::copy_from_slice(datagram.payload()),
        );

        let (insert, front, capacity) = {
            let mut buf = buffer.lock();
            let insert = buf.insert(datagram.full_id(), fragment);
            (insert, buf.current_index(), buf.capacity())
        };

        let detail = || format!("pid: {}, bidx: {}, bcap: {}", datagram.full_id(), front, capacity);
        match insert {
            InsertResult::Inserted => {
                handler.send_acknowledge(datagram.wire_id(), low);
            }
            InsertResult::Duplicate => {
                handler.send_acknowledge(datagram.wire_id(), low);
                tracing::debug!(wire_id = datagram.wire_id(), "duplicated command packet");
                return Err(DecodeError::DuplicatedPacket(detail()));
            }
            InsertResult::Underflow => {
                handler.send_acknowledge(datagram.wire_id(), low);
                tracing::debug!(
                    wire_id = datagram.wire_id(),
                    front,
                    "command packet below buffer front"
                );
                return Err(DecodeError::BufferUnderflow(detail()));
            }
            InsertResult::Overflow => {
                if self.acknowledge_overflow {
                    handler.send_acknowledge(datagram.wire_id(), low);
                }
                tracing::debug!(
                    wire_id = datagram.wire_id(),
                    front,
                    capacity,
                    "command packet beyond buffer capacity"
                );
                return Err(DecodeError::BufferOverflow(detail()));
            }
        }

        loop {
            let taken = buffer.lock().take_command(&self.pool);
            let result = match taken {
                TakeResult::NoCommandsPending => return Ok(()),
                TakeResult::SequenceLengthTooLong { length } => {
                    ReassembleResult::SequenceLengthTooLong { length }
                }
                TakeResult::Taken(raw) => raw.finish(self.max_command_size, &self.pool),
            };

            match result {
                ReassembleResult::NoCommandsPending => return Ok(()),
                ReassembleResult::Success(command) => {
                    handler.decoded_command(packet_type, command);
                    return Ok(());
                }
                ReassembleResult::MoreCommandsPending(command) => {
                    handler.decoded_command(packet_type, command);
                }
                ReassembleResult::SequenceLengthTooLong { length } => {
                    let err = DecodeError::SequenceLengthTooLong(format!(
                        "length: {length}, bcap: {capacity}"
                    ));
                    tracing::warn!(
                        packet_type = %packet_type,
                        error = %err,
                        "command reassembly failed"
                    );
                    return Err(err);
                }
                ReassembleResult::CommandTooLarge { declared, max } => {
                    let err = DecodeError::CommandTooLarge(format!("size: {declared}, max: {max}"));
                    tracing::warn!(
                        packet_type = %packet_type,
                        error = %err,
                        "command reassembly failed"
                    );
                    return Err(err);
                }
                ReassembleResult::CommandDecompressFailed(e) => {
                    let err = DecodeError::CommandDecompressFailed(e.to_string());
                    tracing::warn!(
                        packet_type = %packet_type,
                        error = %err,
                        "command reassembly failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Drop buffered fragments and forget generations.
    pub fn reset(&self) {
        for buffer in &self.command_buffers {
            buffer.lock().reset();
        }
        for estimator in self.estimators.lock().iter_mut() {
            estimator.reset();
        }
    }

    /// Command id 0 carried the handshake; reassembly starts at 1.
    pub fn register_initiv_packet(&self) {
        self.command_buffers[command_buffer_index(PacketType::Command)]
            .lock()
            .set_full_index_to(1);
    }

    /// Return a consumed command's buffer to the pool.
    pub fn recycle(&self, command: ReassembledCommand) {
        self.pool.release(command.into_inner());
    }

    /// Estimated generation of the last id of `packet_type`.
    pub fn generation(&self, packet_type: PacketType) -> u16 {
        self.estimators.lock()[packet_type.index()].generation()
    }

    /// Full id expected next at the front of a command buffer.
    pub fn command_front(&self, packet_type: PacketType) -> u32 {
        self.command_buffers[command_buffer_index(packet_type)]
            .lock()
            .current_index()
    }

    /// Check a raw client datagram with the derived keys, without decoding.
    pub fn verify_encryption_client_packet(
        &self,
        raw: &[u8],
        wire_id: u16,
        packet_type: PacketType,
    ) -> bool {
        let generation = self.generation(packet_type);
        self.cipher.verify_encryption(raw, wire_id, generation)
    }
}
