//! # Transit Wire Format
//!
//! Self-describing fixed-layout packet headers shared by every packet that
//! crosses a [`transit-ring`](../transit_ring/index.html) buffer.
//!
//! ## Layout (little-endian)
//!
//! ```text
//!  offset  size  field
//!  0       8     bytes_in_universal_header   (=16)
//!  8       4     transmission_id (low 31 bits) | type (1 high bit)
//!  12      4     bytes_in_payload
//!  16      8     bytes_in_type_header         (=16)
//!  24      4     type-specific field A
//!  28      4     type-specific field B
//!  32      N     payload (N <= MAX_PAYLOAD_SIZE)
//! ```
//!
//! Data packets use field A = `index_in_transmission`, field B =
//! `n_packets_in_transmission`. Comm packets use field A =
//! `first_packet_index`, field B = `n_bits_in_bitmap`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum payload carried by a single packet.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Size of the universal header prefix.
pub const UNIVERSAL_HEADER_LEN: usize = 16;

/// Size of the per-type header.
pub const TYPE_HEADER_LEN: usize = 16;

/// Total header size (universal + per-type).
pub const HEADER_LEN: usize = UNIVERSAL_HEADER_LEN + TYPE_HEADER_LEN;

/// Largest possible encoded packet (header + max payload).
pub const MAX_PACKET_SIZE: usize = HEADER_LEN + MAX_PAYLOAD_SIZE;

/// Transmission ids occupy the low 31 bits of the id/type word.
pub const MAX_TRANSMISSION_ID: u32 = (1 << 31) - 1;

const TYPE_BIT: u32 = 1 << 31;

// ─── PacketType ──────────────────────────────────────────────────────────────

/// Discriminant carried in the high bit of the universal header's id word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Comm = 1,
}

impl PacketType {
    fn from_bit(bit: bool) -> Self {
        if bit { PacketType::Comm } else { PacketType::Data }
    }
}

// ─── Body ────────────────────────────────────────────────────────────────────

/// The per-type header fields, decoded according to `PacketType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBody {
    Data {
        index_in_transmission: u32,
        n_packets_in_transmission: u32,
    },
    Comm {
        first_packet_index: u32,
        n_bits_in_bitmap: u32,
    },
}

impl PacketBody {
    fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::Data { .. } => PacketType::Data,
            PacketBody::Comm { .. } => PacketType::Comm,
        }
    }

    fn field_a(&self) -> u32 {
        match *self {
            PacketBody::Data { index_in_transmission, .. } => index_in_transmission,
            PacketBody::Comm { first_packet_index, .. } => first_packet_index,
        }
    }

    fn field_b(&self) -> u32 {
        match *self {
            PacketBody::Data { n_packets_in_transmission, .. } => n_packets_in_transmission,
            PacketBody::Comm { n_bits_in_bitmap, .. } => n_bits_in_bitmap,
        }
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// A fully decoded packet: header fields plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub transmission_id: u32,
    pub body: PacketBody,
    pub payload: Bytes,
}

impl Packet {
    /// Build a DATA_PACKET.
    pub fn new_data(
        transmission_id: u32,
        index_in_transmission: u32,
        n_packets_in_transmission: u32,
        payload: Bytes,
    ) -> Option<Self> {
        if transmission_id > MAX_TRANSMISSION_ID {
            return None;
        }
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_SIZE {
            return None;
        }
        if index_in_transmission >= n_packets_in_transmission {
            return None;
        }
        Some(Packet {
            transmission_id,
            body: PacketBody::Data {
                index_in_transmission,
                n_packets_in_transmission,
            },
            payload,
        })
    }

    /// Build a COMM_PACKET carrying an ACK/NACK bitmap.
    pub fn new_comm(
        transmission_id: u32,
        first_packet_index: u32,
        n_bits_in_bitmap: u32,
        payload: Bytes,
    ) -> Option<Self> {
        if transmission_id > MAX_TRANSMISSION_ID {
            return None;
        }
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_SIZE {
            return None;
        }
        Some(Packet {
            transmission_id,
            body: PacketBody::Comm {
                first_packet_index,
                n_bits_in_bitmap,
            },
            payload,
        })
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }

    /// Total encoded size of this packet.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode this packet onto `buf` in the layout documented at the top of
    /// this module.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u64_le(UNIVERSAL_HEADER_LEN as u64);
        let type_bit = matches!(self.packet_type(), PacketType::Comm);
        let id_word = self.transmission_id | if type_bit { TYPE_BIT } else { 0 };
        buf.put_u32_le(id_word);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u64_le(TYPE_HEADER_LEN as u64);
        buf.put_u32_le(self.body.field_a());
        buf.put_u32_le(self.body.field_b());
        buf.put_slice(&self.payload);
    }

    /// Encode into a freshly allocated buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a packet from `buf`, validating every invariant from the data
    /// model. Returns `None` on truncation or a violated invariant; never
    /// panics on attacker-controlled input.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < UNIVERSAL_HEADER_LEN {
            return None;
        }
        let universal_len = buf.get_u64_le();
        if universal_len != UNIVERSAL_HEADER_LEN as u64 {
            return None;
        }
        let id_word = buf.get_u32_le();
        let transmission_id = id_word & MAX_TRANSMISSION_ID;
        let packet_type = PacketType::from_bit(id_word & TYPE_BIT != 0);
        let payload_len = buf.get_u32_le() as usize;
        if payload_len == 0 || payload_len > MAX_PAYLOAD_SIZE {
            return None;
        }

        if buf.remaining() < TYPE_HEADER_LEN {
            return None;
        }
        let type_header_len = buf.get_u64_le();
        if type_header_len != TYPE_HEADER_LEN as u64 {
            return None;
        }
        let field_a = buf.get_u32_le();
        let field_b = buf.get_u32_le();

        if buf.remaining() < payload_len {
            return None;
        }
        let payload = buf.copy_to_bytes(payload_len);

        let body = match packet_type {
            PacketType::Data => {
                if field_a >= field_b {
                    return None;
                }
                PacketBody::Data {
                    index_in_transmission: field_a,
                    n_packets_in_transmission: field_b,
                }
            }
            PacketType::Comm => PacketBody::Comm {
                first_packet_index: field_a,
                n_bits_in_bitmap: field_b,
            },
        };

        Some(Packet {
            transmission_id,
            body,
            payload,
        })
    }
}

/// Number of `MAX_PAYLOAD_SIZE` chunks needed to hold `len` bytes.
pub fn packet_count_for_len(len: usize) -> u32 {
    ((len + MAX_PAYLOAD_SIZE - 1) / MAX_PAYLOAD_SIZE).max(1) as u32
}
