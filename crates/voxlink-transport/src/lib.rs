//! # voxlink-transport
//!
//! Reliable, encrypted transport beneath the Voxlink voice protocol.
//!
//! Datagrams carry a 16-bit wire id per packet type; the receiver extends it
//! to a 32-bit full id by estimating wrap-around generations. Commands are
//! fragmented, optionally compressed, acknowledged and retransmitted on an
//! RTT-derived timeout; voice is unreliable and only loss-accounted. Every
//! payload is AES-EAX encrypted with a key derived per direction, type, id
//! and generation.
//!
//! ## Crate structure
//!
//! - [`wire`] — Header layout, packet types and flags, datagram view
//! - [`generation`] — Generation estimator and outgoing id allocation
//! - [`crypto`] — Key derivation, key cache, EAX encrypt/decrypt
//! - [`compression`] — Bounded DEFLATE payload compression
//! - [`pool`] — Reusable command buffers
//! - [`reorder`] — Command reorder buffer and reassembly
//! - [`arq`] — RTT estimation and acknowledged retransmission
//! - [`loss`] — Unordered and ordered loss trackers
//! - [`statistics`] — Per-connection loss accounting
//! - [`decoder`] — Receive pipeline
//! - [`encoder`] — Send pipeline
//! - [`connection`] — One peer: decoder, encoder and lifecycle
//! - [`config`] — TOML-backed transport configuration
//! - [`error`] — Error types

pub mod arq;
pub mod compression;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod generation;
pub mod loss;
pub mod pool;
pub mod reorder;
pub mod statistics;
pub mod wire;

pub use config::TransportConfig;
pub use connection::{Connection, ConnectionHandler, ConnectionState};
pub use decoder::{DecodeHandler, PacketDecoder};
pub use encoder::PacketEncoder;
pub use error::{DecodeError, TransportError};
