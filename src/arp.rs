//! ARP (Address Resolution Protocol) over Ethernet II.
//!
//! # Packet Format (RFC 826)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Hardware Type         |         Protocol Type         |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |  HLen |  PLen |            Operation (1=Req, 2=Reply)         |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Sender Hardware Address (6 bytes)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Sender Protocol Address (4 bytes)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Target Hardware Address (6 bytes)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Target Protocol Address (4 bytes)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! The resolver answers requests for addresses owned by a registered
//! adapter and learns `IP -> MAC` mappings from replies. Entries are
//! last-writer-wins and are never evicted.
//!
//! TODO: rate limiting and conflict detection for learned entries once the
//! stack grows a notion of trusted neighbors.
//!
//! # References
//!
//! - RFC 826: Ethernet Address Resolution Protocol

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::device::AdapterRegistry;
use crate::ethernet::EthAddr;
use crate::ipv4::Ipv4Addr;

// ============================================================================
// ARP Constants (RFC 826)
// ============================================================================

/// Hardware type: Ethernet
pub const HTYPE_ETHERNET: u16 = 1;

/// Protocol type: IPv4
pub const PTYPE_IPV4: u16 = 0x0800;

/// Hardware address length: Ethernet MAC (6 bytes)
pub const HLEN_ETHERNET: u8 = 6;

/// Protocol address length: IPv4 (4 bytes)
pub const PLEN_IPV4: u8 = 4;

/// ARP operation: Request
pub const OPCODE_REQUEST: u16 = 1;

/// ARP operation: Reply
pub const OPCODE_REPLY: u16 = 2;

/// ARP packet size for Ethernet/IPv4
pub const ARP_PACKET_LEN: usize = 28;

// ============================================================================
// ARP Operation
// ============================================================================

/// ARP operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    /// ARP Request (who-has)
    Request,
    /// ARP Reply (is-at)
    Reply,
}

impl ArpOp {
    /// Convert from a raw opcode.
    pub fn from_raw(op: u16) -> Option<Self> {
        match op {
            OPCODE_REQUEST => Some(ArpOp::Request),
            OPCODE_REPLY => Some(ArpOp::Reply),
            _ => None,
        }
    }

    /// Convert to a raw opcode.
    pub fn to_raw(self) -> u16 {
        match self {
            ArpOp::Request => OPCODE_REQUEST,
            ArpOp::Reply => OPCODE_REPLY,
        }
    }
}

// ============================================================================
// ARP Packet
// ============================================================================

/// Parsed ARP packet for Ethernet/IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    /// Sender hardware (MAC) address
    pub sender_hw: EthAddr,
    /// Sender protocol (IP) address
    pub sender_ip: Ipv4Addr,
    /// Target hardware (MAC) address
    pub target_hw: EthAddr,
    /// Target protocol (IP) address
    pub target_ip: Ipv4Addr,
    /// ARP operation
    pub op: ArpOp,
}

/// Errors from ARP processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    /// Packet is too short
    Truncated,
    /// Hardware type is not Ethernet, or hardware length is not 6
    NotEthernet,
    /// Protocol type is not IPv4, or protocol length is not 4
    NotIpv4,
    /// Unknown operation code
    InvalidOpcode,
}

// ============================================================================
// ARP Table
// ============================================================================

/// Process-wide `IPv4 -> MAC` resolution table.
///
/// All mutation and lookup happens under one lock. Insertion overwrites any
/// existing entry for the same address; nothing in this layer ever removes
/// an entry. Adapters consult the table on the transmit path when asked to
/// send with a zero destination MAC.
pub struct ArpTable {
    entries: Mutex<BTreeMap<Ipv4Addr, EthAddr>>,
}

impl ArpTable {
    /// Create an empty table.
    pub const fn new() -> Self {
        ArpTable {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Insert or overwrite the mapping for `ip`.
    pub fn insert(&self, ip: Ipv4Addr, mac: EthAddr) {
        self.entries.lock().insert(ip, mac);
    }

    /// Look up the MAC address for `ip`.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<EthAddr> {
        self.entries.lock().get(&ip).copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ARP Statistics
// ============================================================================

/// ARP protocol statistics.
#[derive(Debug, Default)]
pub struct ArpStats {
    /// ARP packets received
    pub rx_packets: AtomicU64,
    /// ARP requests received
    pub rx_requests: AtomicU64,
    /// ARP replies received
    pub rx_replies: AtomicU64,
    /// ARP replies sent
    pub tx_replies: AtomicU64,
    /// Packets dropped due to parse errors
    pub rx_errors: AtomicU64,
}

impl ArpStats {
    pub const fn new() -> Self {
        ArpStats {
            rx_packets: AtomicU64::new(0),
            rx_requests: AtomicU64::new(0),
            rx_replies: AtomicU64::new(0),
            tx_replies: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_rx_packets(&self) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rx_requests(&self) {
        self.rx_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rx_replies(&self) {
        self.rx_replies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tx_replies(&self) {
        self.tx_replies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rx_errors(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// ARP Parsing & Serialization
// ============================================================================

/// Parse an ARP packet from an Ethernet payload.
///
/// Frames that are not Ethernet/IPv4 ARP (hardware type 1, hardware length
/// 6, protocol type 0x0800, protocol length 4) are rejected.
pub fn parse_arp(buf: &[u8]) -> Result<ArpPacket, ArpError> {
    if buf.len() < ARP_PACKET_LEN {
        return Err(ArpError::Truncated);
    }

    let htype = u16::from_be_bytes([buf[0], buf[1]]);
    let hlen = buf[4];
    if htype != HTYPE_ETHERNET || hlen != HLEN_ETHERNET {
        return Err(ArpError::NotEthernet);
    }

    let ptype = u16::from_be_bytes([buf[2], buf[3]]);
    let plen = buf[5];
    if ptype != PTYPE_IPV4 || plen != PLEN_IPV4 {
        return Err(ArpError::NotIpv4);
    }

    let opcode = u16::from_be_bytes([buf[6], buf[7]]);
    let op = ArpOp::from_raw(opcode).ok_or(ArpError::InvalidOpcode)?;

    let mut sender_hw = [0u8; 6];
    sender_hw.copy_from_slice(&buf[8..14]);
    let sender_ip = Ipv4Addr([buf[14], buf[15], buf[16], buf[17]]);

    let mut target_hw = [0u8; 6];
    target_hw.copy_from_slice(&buf[18..24]);
    let target_ip = Ipv4Addr([buf[24], buf[25], buf[26], buf[27]]);

    Ok(ArpPacket {
        sender_hw: EthAddr(sender_hw),
        sender_ip,
        target_hw: EthAddr(target_hw),
        target_ip,
        op,
    })
}

/// Serialize an ARP packet to its 28-byte wire form.
pub fn serialize_arp(pkt: &ArpPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ARP_PACKET_LEN);
    buf.extend_from_slice(&HTYPE_ETHERNET.to_be_bytes());
    buf.extend_from_slice(&PTYPE_IPV4.to_be_bytes());
    buf.push(HLEN_ETHERNET);
    buf.push(PLEN_IPV4);
    buf.extend_from_slice(&pkt.op.to_raw().to_be_bytes());
    buf.extend_from_slice(&pkt.sender_hw.0);
    buf.extend_from_slice(&pkt.sender_ip.octets());
    buf.extend_from_slice(&pkt.target_hw.0);
    buf.extend_from_slice(&pkt.target_ip.octets());
    buf
}

/// Build the reply to `request`, announcing `our_mac`/`our_ip`.
pub fn build_arp_reply(our_mac: EthAddr, our_ip: Ipv4Addr, request: &ArpPacket) -> Vec<u8> {
    serialize_arp(&ArpPacket {
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: request.sender_hw,
        target_ip: request.sender_ip,
        op: ArpOp::Reply,
    })
}

/// Build a who-has request for `target_ip`.
pub fn build_arp_request(our_mac: EthAddr, our_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    serialize_arp(&ArpPacket {
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: EthAddr::ZERO,
        target_ip,
        op: ArpOp::Request,
    })
}

// ============================================================================
// ARP Processing
// ============================================================================

/// Result of processing an inbound ARP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpResult {
    /// Packet was consumed, nothing sent
    Handled,
    /// A reply was transmitted through the owning adapter
    Replied,
    /// Packet was dropped with reason
    Dropped(ArpError),
}

/// Process an inbound ARP packet from an Ethernet payload.
///
/// Requests whose target protocol address belongs to a registered adapter
/// are answered through that adapter, addressed to the requester's hardware
/// address. Replies populate the resolution table.
pub fn process_arp(
    payload: &[u8],
    adapters: &AdapterRegistry,
    table: &ArpTable,
    stats: &ArpStats,
) -> ArpResult {
    stats.inc_rx_packets();

    let pkt = match parse_arp(payload) {
        Ok(p) => p,
        Err(e) => {
            stats.inc_rx_errors();
            log::debug!("arp: dropping packet: {:?}", e);
            return ArpResult::Dropped(e);
        }
    };

    match pkt.op {
        ArpOp::Request => {
            stats.inc_rx_requests();
            let adapter = match adapters.from_ipv4_address(pkt.target_ip) {
                Some(a) => a,
                None => return ArpResult::Handled,
            };

            let (our_mac, our_ip) = {
                let adapter = adapter.lock();
                (adapter.mac_address(), adapter.ipv4_address())
            };
            log::debug!("arp: answering who-has for {}", our_ip);

            let reply = build_arp_reply(our_mac, our_ip, &pkt);
            adapter
                .lock()
                .send_ethernet(pkt.sender_hw, crate::ethernet::ETHERTYPE_ARP, &reply);
            stats.inc_tx_replies();
            ArpResult::Replied
        }
        ArpOp::Reply => {
            stats.inc_rx_replies();
            table.insert(pkt.sender_ip, pkt.sender_hw);
            log::debug!(
                "arp: learned {} is-at {} ({} entries)",
                pkt.sender_ip,
                pkt.sender_hw,
                table.len()
            );
            ArpResult::Handled
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
