//! Datagram wire format.
//!
//! Every UDP payload starts with a packet type and a big-endian sequence
//! number. DATA records add a compressed flag and the AEAD output:
//!
//! ```text
//! ┌──────────┬──────────────┬───────────┬───────────┬────────────┬──────────┐
//! │ type (1) │ seq be32 (4) │ flag (1)  │ nonce (12)│ ciphertext │ tag (16) │
//! └──────────┴──────────────┴───────────┴───────────┴────────────┴──────────┘
//!            └────────── 6-byte header = AAD ────────┘
//! ```
//!
//! Keep-alive traffic is exactly 5 bytes: type and sequence, nothing else.

use crate::crypto::RECORD_OVERHEAD;
use crate::error::{Error, Result};
use crate::TUN_MTU;

/// Outer IPv4 header size assumed by the MTU budget.
const IP_HEADER_SIZE: usize = 20;

/// Outer UDP header size.
const UDP_HEADER_SIZE: usize = 8;

/// IPv4-form SOCKS5 UDP-Associate envelope size.
pub const SOCKS5_ENVELOPE_SIZE: usize = 10;

/// DATA record header size (type + sequence + compressed flag).
pub const HEADER_SIZE: usize = 6;

/// Keep-alive frame size (type + sequence).
pub const CONTROL_SIZE: usize = 5;

/// Packet types on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Sealed data record
    Data = 0x01,
    /// Keep-alive probe
    Keepalive = 0x02,
    /// Keep-alive echo
    KeepaliveAck = 0x03,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(PacketType::Data),
            0x02 => Ok(PacketType::Keepalive),
            0x03 => Ok(PacketType::KeepaliveAck),
            other => Err(Error::packet(format!("unknown packet type: {other:#04x}"))),
        }
    }
}

/// DATA record header. Its six encoded bytes are the record's AAD, so any
/// in-flight modification of type, sequence, or flag voids the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender-assigned sequence number
    pub sequence: u32,
    /// Whether the sealed payload is an LZ4 frame
    pub compressed: bool,
}

impl Header {
    /// Encode to the 6-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PacketType::Data as u8;
        buf[1..5].copy_from_slice(&self.sequence.to_be_bytes());
        buf[5] = self.compressed as u8;
        buf
    }
}

/// Encode a 5-byte keep-alive or keep-alive-ack frame.
pub fn encode_control(packet_type: PacketType, sequence: u32) -> [u8; CONTROL_SIZE] {
    let mut buf = [0u8; CONTROL_SIZE];
    buf[0] = packet_type as u8;
    buf[1..5].copy_from_slice(&sequence.to_be_bytes());
    buf
}

/// One parsed datagram, before decryption.
#[derive(Debug)]
pub enum Frame<'a> {
    /// A DATA record; `record` is the AEAD output following the header.
    Data {
        /// Parsed header (re-encode it to recover the AAD)
        header: Header,
        /// `nonce || ciphertext || tag`
        record: &'a [u8],
    },
    /// A keep-alive probe to be echoed.
    Keepalive {
        /// Sequence to echo back
        sequence: u32,
    },
    /// An echo of one of our probes.
    KeepaliveAck {
        /// Echoed sequence
        sequence: u32,
    },
}

impl<'a> Frame<'a> {
    /// Parse one datagram payload (after any SOCKS5 envelope is stripped).
    pub fn parse(buf: &'a [u8]) -> Result<Frame<'a>> {
        if buf.len() < CONTROL_SIZE {
            return Err(Error::packet(format!("datagram too short: {} bytes", buf.len())));
        }

        let packet_type = PacketType::try_from(buf[0])?;
        let sequence = u32::from_be_bytes(buf[1..5].try_into().unwrap());

        match packet_type {
            PacketType::Keepalive => Ok(Frame::Keepalive { sequence }),
            PacketType::KeepaliveAck => Ok(Frame::KeepaliveAck { sequence }),
            PacketType::Data => {
                if buf.len() < HEADER_SIZE + RECORD_OVERHEAD {
                    return Err(Error::packet(format!(
                        "data record too short: {} bytes",
                        buf.len()
                    )));
                }
                let compressed = match buf[5] {
                    0x00 => false,
                    0x01 => true,
                    other => {
                        return Err(Error::packet(format!(
                            "invalid compressed flag: {other:#04x}"
                        )))
                    }
                };
                Ok(Frame::Data {
                    header: Header { sequence, compressed },
                    record: &buf[HEADER_SIZE..],
                })
            }
        }
    }
}

/// Largest plaintext one datagram can carry.
///
/// Everything the outer path adds is subtracted from the interface MTU:
/// IP and UDP headers, the record header, the AEAD nonce and tag, and the
/// SOCKS5 envelope when the obfuscation hop is in use.
pub const fn max_payload(socks5: bool) -> usize {
    let budget = TUN_MTU - IP_HEADER_SIZE - UDP_HEADER_SIZE - HEADER_SIZE - RECORD_OVERHEAD;
    if socks5 {
        budget - SOCKS5_ENVELOPE_SIZE
    } else {
        budget
    }
}
