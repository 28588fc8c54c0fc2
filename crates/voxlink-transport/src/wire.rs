//! # Voxlink Wire Format
//!
//! Every datagram starts with an 8-byte MAC followed by a short header. The
//! header shape depends on who sent the datagram.
//!
//! ```text
//! server → client (11 bytes)
//! +--------+---------+------------+
//! | MAC(8) | id(u16) | type|flags |
//! +--------+---------+------------+
//!
//! client → server (13 bytes)
//! +--------+---------+----------------+------------+
//! | MAC(8) | id(u16) | client id(u16) | type|flags |
//! +--------+---------+----------------+------------+
//! ```
//!
//! Integers are big-endian. The low nibble of the last header byte is the
//! packet type, the high nibble holds the flags. The header (without MAC) is
//! the associated data of the packet cipher.

use bytes::BufMut;
use std::fmt;
use std::ops::BitOr;

use crate::error::WireError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Length of the detached authentication tag leading every datagram.
pub const MAC_SIZE: usize = 8;

/// Header bytes after the MAC for datagrams sent by the server.
pub const SERVER_HEADER_SIZE: usize = 3;

/// Header bytes after the MAC for datagrams sent by a client.
pub const CLIENT_HEADER_SIZE: usize = 5;

// ─── Packet Type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketType {
    Voice = 0x00,
    VoiceWhisper = 0x01,
    Command = 0x02,
    CommandLow = 0x03,
    Ping = 0x04,
    Pong = 0x05,
    Ack = 0x06,
    AckLow = 0x07,
    Init = 0x08,
}

impl PacketType {
    /// Number of defined packet types; per-type tables are sized by this.
    pub const COUNT: usize = 9;

    pub const ALL: [PacketType; Self::COUNT] = [
        PacketType::Voice,
        PacketType::VoiceWhisper,
        PacketType::Command,
        PacketType::CommandLow,
        PacketType::Ping,
        PacketType::Pong,
        PacketType::Ack,
        PacketType::AckLow,
        PacketType::Init,
    ];

    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0x00 => Ok(PacketType::Voice),
            0x01 => Ok(PacketType::VoiceWhisper),
            0x02 => Ok(PacketType::Command),
            0x03 => Ok(PacketType::CommandLow),
            0x04 => Ok(PacketType::Ping),
            0x05 => Ok(PacketType::Pong),
            0x06 => Ok(PacketType::Ack),
            0x07 => Ok(PacketType::AckLow),
            0x08 => Ok(PacketType::Init),
            other => Err(WireError::UnknownType(other)),
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Reliable, ordered, fragmentable types.
    #[inline]
    pub fn is_command(self) -> bool {
        matches!(self, PacketType::Command | PacketType::CommandLow)
    }

    /// The acknowledgement type answering this command type.
    pub fn acknowledge_type(self) -> Option<PacketType> {
        match self {
            PacketType::Command => Some(PacketType::Ack),
            PacketType::CommandLow => Some(PacketType::AckLow),
            _ => None,
        }
    }

    /// The command type an acknowledgement of this type refers to.
    pub fn acknowledged_type(self) -> PacketType {
        match self {
            PacketType::AckLow => PacketType::CommandLow,
            _ => PacketType::Command,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ─── Packet Flags ────────────────────────────────────────────────────────────

/// High-nibble flag bits of the type byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    /// Set on the first and on the terminal fragment of a split command.
    pub const FRAGMENTED: PacketFlags = PacketFlags(0x10);
    pub const NEW_PROTOCOL: PacketFlags = PacketFlags(0x20);
    pub const COMPRESSED: PacketFlags = PacketFlags(0x40);
    pub const UNENCRYPTED: PacketFlags = PacketFlags(0x80);

    const MASK: u8 = 0xF0;

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        PacketFlags(bits & Self::MASK)
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self {
        PacketFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::FRAGMENTED) {
            names.push("FRAGMENTED");
        }
        if self.contains(Self::NEW_PROTOCOL) {
            names.push("NEW_PROTOCOL");
        }
        if self.contains(Self::COMPRESSED) {
            names.push("COMPRESSED");
        }
        if self.contains(Self::UNENCRYPTED) {
            names.push("UNENCRYPTED");
        }
        write!(f, "PacketFlags({})", names.join(" | "))
    }
}

// ─── Origin ──────────────────────────────────────────────────────────────────

/// Sender of a datagram; selects the header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Server,
    Client,
}

impl Origin {
    #[inline]
    pub fn header_size(self) -> usize {
        match self {
            Origin::Server => SERVER_HEADER_SIZE,
            Origin::Client => CLIENT_HEADER_SIZE,
        }
    }

    /// Whether datagrams of this origin travel towards the server.
    #[inline]
    pub fn to_server(self) -> bool {
        self == Origin::Client
    }

    pub fn opposite(self) -> Origin {
        match self {
            Origin::Server => Origin::Client,
            Origin::Client => Origin::Server,
        }
    }
}

// ─── Datagram View ───────────────────────────────────────────────────────────

/// Borrowed, mutable view over one received datagram.
///
/// The header fields are decoded once at parse time; the payload is decrypted
/// in place by the decoder. The generation is not on the wire and is attached
/// by the generation estimator.
pub struct Datagram<'a> {
    buf: &'a mut [u8],
    origin: Origin,
    packet_type: PacketType,
    flags: PacketFlags,
    wire_id: u16,
    client_id: u16,
    generation: u16,
}

impl<'a> Datagram<'a> {
    pub fn parse(buf: &'a mut [u8], origin: Origin) -> Result<Self, WireError> {
        let min = MAC_SIZE + origin.header_size();
        if buf.len() < min {
            return Err(WireError::TooShort {
                len: buf.len(),
                min,
            });
        }

        let wire_id = u16::from_be_bytes([buf[MAC_SIZE], buf[MAC_SIZE + 1]]);
        let (client_id, type_byte) = match origin {
            Origin::Server => (0, buf[MAC_SIZE + 2]),
            Origin::Client => (
                u16::from_be_bytes([buf[MAC_SIZE + 2], buf[MAC_SIZE + 3]]),
                buf[MAC_SIZE + 4],
            ),
        };
        let packet_type = PacketType::from_u8(type_byte & 0x0F)?;

        Ok(Datagram {
            buf,
            origin,
            packet_type,
            flags: PacketFlags::from_bits(type_byte),
            wire_id,
            client_id,
            generation: 0,
        })
    }

    #[inline]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    #[inline]
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[inline]
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    #[inline]
    pub fn has_flag(&self, flag: PacketFlags) -> bool {
        self.flags.contains(flag)
    }

    #[inline]
    pub fn wire_id(&self) -> u16 {
        self.wire_id
    }

    /// Zero for server-originated datagrams.
    #[inline]
    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    #[inline]
    pub fn generation(&self) -> u16 {
        self.generation
    }

    #[inline]
    pub fn set_generation(&mut self, generation: u16) {
        self.generation = generation;
    }

    /// `generation << 16 | wire_id`.
    #[inline]
    pub fn full_id(&self) -> u32 {
        ((self.generation as u32) << 16) | self.wire_id as u32
    }

    pub fn mac(&self) -> &[u8] {
        &self.buf[..MAC_SIZE]
    }

    pub fn header(&self) -> &[u8] {
        &self.buf[MAC_SIZE..MAC_SIZE + self.origin.header_size()]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[MAC_SIZE + self.origin.header_size()..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = MAC_SIZE + self.origin.header_size();
        &mut self.buf[start..]
    }

    /// `(mac, header, payload)` with a writable payload for in-place decryption.
    pub fn split_mut(&mut self) -> (&[u8], &[u8], &mut [u8]) {
        let (mac, rest) = self.buf.split_at_mut(MAC_SIZE);
        let (header, payload) = rest.split_at_mut(self.origin.header_size());
        (mac, header, payload)
    }
}

impl fmt::Debug for Datagram<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datagram")
            .field("type", &self.packet_type)
            .field("flags", &self.flags)
            .field("wire_id", &self.wire_id)
            .field("generation", &self.generation)
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

// ─── Header Encoding ─────────────────────────────────────────────────────────

/// Write the header (without MAC) of an outgoing datagram.
pub fn encode_header(
    buf: &mut impl BufMut,
    origin: Origin,
    wire_id: u16,
    client_id: u16,
    packet_type: PacketType,
    flags: PacketFlags,
) {
    buf.put_u16(wire_id);
    if origin == Origin::Client {
        buf.put_u16(client_id);
    }
    buf.put_u8(packet_type.as_u8() | flags.bits());
}
