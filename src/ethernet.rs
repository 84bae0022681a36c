//! Ethernet II framing.
//!
//! # Frame Header Format
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |              Destination MAC Address (6 bytes)                |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                 Source MAC Address (6 bytes)                  |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |           EtherType           |          Payload ...          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! Every inbound frame passes through [`parse_ethernet`] before any protocol
//! handler sees it; frames shorter than a header are rejected up front.

use alloc::vec::Vec;

/// Ethernet header length in bytes (6 dst + 6 src + 2 ethertype).
pub const ETH_HEADER_LEN: usize = 14;

/// EtherType: IPv4
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// EtherType: ARP
pub const ETHERTYPE_ARP: u16 = 0x0806;

// ============================================================================
// MAC Address
// ============================================================================

/// Ethernet MAC address (6 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    /// All-zero address. On the IPv4 transmit path a zero destination tells
    /// the adapter to resolve the real MAC through its ARP table.
    pub const ZERO: EthAddr = EthAddr([0; 6]);

    /// Broadcast address (ff:ff:ff:ff:ff:ff).
    pub const BROADCAST: EthAddr = EthAddr([0xff; 6]);

    /// Create from individual octets.
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        EthAddr([a, b, c, d, e, f])
    }

    /// Check if this is the broadcast address.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// Check if this is a multicast address (group bit set).
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Check if this is the all-zero address.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Get the raw bytes.
    #[inline]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl core::fmt::Display for EthAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

// ============================================================================
// Ethernet Header
// ============================================================================

/// Parsed Ethernet II frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    /// Destination MAC address
    pub dst: EthAddr,
    /// Source MAC address
    pub src: EthAddr,
    /// EtherType of the payload
    pub ethertype: u16,
}

/// Errors from Ethernet frame parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthError {
    /// Frame is shorter than an Ethernet header
    Truncated,
}

/// Parse an Ethernet II frame into its header and payload.
pub fn parse_ethernet(frame: &[u8]) -> Result<(EthHeader, &[u8]), EthError> {
    if frame.len() < ETH_HEADER_LEN {
        return Err(EthError::Truncated);
    }

    let mut dst = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    let mut src = [0u8; 6];
    src.copy_from_slice(&frame[6..12]);
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

    let header = EthHeader {
        dst: EthAddr(dst),
        src: EthAddr(src),
        ethertype,
    };

    Ok((header, &frame[ETH_HEADER_LEN..]))
}

/// Build a complete Ethernet II frame around `payload`.
pub fn build_ethernet_frame(dst: EthAddr, src: EthAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

// ============================================================================
// Tests
// ============================================================================
