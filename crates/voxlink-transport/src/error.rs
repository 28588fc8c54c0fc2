//! # Error Types
//!
//! One enum per concern. `DecodeError` is the per-datagram outcome of the
//! receive pipeline and knows which failures tear the connection down.

use thiserror::Error;

use crate::wire::PacketType;

// ─── Wire ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("datagram too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
}

// ─── Crypto ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("key generation failed for packet type {0}")]
    KeyGeneration(u8),
    #[error("failed to verify packet")]
    AuthenticationFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("invalid shared iv length {0} (expected 20 or 64)")]
    InvalidIvLength(usize),
}

// ─── Compression ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompressionError {
    #[error("payload too short for a compression header ({0} bytes)")]
    TooShort(usize),
    #[error("header declares {declared} bytes but payload has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("declared size {declared} exceeds limit {max}")]
    TooLarge { declared: usize, max: usize },
    #[error("output buffer holds {available} bytes, {required} required")]
    BufferTooSmall { available: usize, required: usize },
    #[error("codec failure: {0}")]
    Codec(String),
}

// ─── Decode Pipeline ────────────────────────────────────────────────────────

/// How a decode failure affects the owning connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Packet dropped, connection continues.
    Recoverable,
    /// Packet dropped; a persistent rate is a health signal.
    Crypto,
    /// The reliable channel must be torn down.
    Fatal,
}

/// Outcome of a failed `PacketDecoder::process_incoming_data` call.
///
/// Every variant carries a human readable detail string (packet id, buffer
/// front, capacity, codec message).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("duplicated packet ({0})")]
    DuplicatedPacket(String),
    #[error("reorder buffer underflow ({0})")]
    BufferUnderflow(String),
    #[error("reorder buffer overflow ({0})")]
    BufferOverflow(String),
    #[error("failed to generate decrypt key ({0})")]
    DecryptKeyGenFailed(String),
    #[error("failed to decrypt packet ({0})")]
    DecryptFailed(String),
    #[error("command sequence too long ({0})")]
    SequenceLengthTooLong(String),
    #[error("command too large ({0})")]
    CommandTooLarge(String),
    #[error("failed to decompress command ({0})")]
    CommandDecompressFailed(String),
}

impl DecodeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DecodeError::DuplicatedPacket(_)
            | DecodeError::BufferUnderflow(_)
            | DecodeError::BufferOverflow(_) => ErrorClass::Recoverable,
            DecodeError::DecryptKeyGenFailed(_) | DecodeError::DecryptFailed(_) => {
                ErrorClass::Crypto
            }
            DecodeError::SequenceLengthTooLong(_)
            | DecodeError::CommandTooLarge(_)
            | DecodeError::CommandDecompressFailed(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

// ─── Send Path / Connection ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{packet_type:?} packet {full_id} not acknowledged after {resend_count} resends")]
    ResendBudgetExhausted {
        packet_type: PacketType,
        full_id: u32,
        resend_count: u32,
    },
    #[error("failed to compress command: {0}")]
    CompressionFailed(#[from] CompressionError),
    #[error("failed to encrypt packet: {0}")]
    Encrypt(#[from] CryptoError),
    #[error("malformed datagram: {0}")]
    Wire(#[from] WireError),
    #[error("{0}")]
    Decode(#[from] DecodeError),
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
}

// ─── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("reorder_capacity must be a power of two >= 2, got {0}")]
    ReorderCapacity(usize),
    #[error("generation_window must be in 1..=32767, got {0}")]
    GenerationWindow(u32),
    #[error("max_fragment_payload must be non-zero")]
    FragmentPayload,
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("invalid config: {0}")]
    Parse(String),
}
