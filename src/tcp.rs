//! TCP header codec, connection states, and the pseudo-header checksum.
//!
//! # Header Format (RFC 793)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                        Sequence Number                        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                     Acknowledgment Number                     |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Data  |       |U|A|P|R|S|F|                                   |
//! | Offs  | Resv  |R|C|S|S|Y|I|            Window                 |
//! |       |       |G|K|H|T|N|N|                                   |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |           Checksum            |         Urgent Pointer        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! The connection state machine itself lives with the sockets; this module
//! owns the wire format and the state vocabulary.
//!
//! # References
//!
//! - RFC 793: Transmission Control Protocol

use alloc::vec::Vec;

use crate::ipv4::{checksum_with_pseudo_header, Ipv4Addr, Ipv4Proto};

// ============================================================================
// TCP Constants
// ============================================================================

/// TCP header length in bytes (no options).
pub const TCP_HEADER_MIN_LEN: usize = 20;

/// TCP protocol number (for IPv4).
pub const TCP_PROTO: u8 = 6;

/// Receive window advertised on every outbound segment.
pub const TCP_ADVERTISED_WINDOW: u16 = 1024;

// ============================================================================
// TCP Flags
// ============================================================================

/// FIN flag - sender has finished sending
pub const TCP_FLAG_FIN: u8 = 0x01;
/// SYN flag - synchronize sequence numbers
pub const TCP_FLAG_SYN: u8 = 0x02;
/// RST flag - reset the connection
pub const TCP_FLAG_RST: u8 = 0x04;
/// PSH flag - push function
pub const TCP_FLAG_PSH: u8 = 0x08;
/// ACK flag - acknowledgment field is significant
pub const TCP_FLAG_ACK: u8 = 0x10;
/// URG flag - urgent pointer field is significant
pub const TCP_FLAG_URG: u8 = 0x20;

// ============================================================================
// TCP State
// ============================================================================

/// TCP connection state per RFC 793.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No connection state at all
    Closed,
    /// Waiting for a connection request from any remote TCP
    Listen,
    /// Waiting for a matching connection request after having sent one
    SynSent,
    /// Waiting for confirming connection request acknowledgment
    SynReceived,
    /// Open connection, data can be exchanged
    Established,
    /// Local close sent, waiting for acknowledgment or the peer's close
    FinWait1,
    /// Local close acknowledged, waiting for the peer's close
    FinWait2,
    /// Peer closed, waiting for the local user to close
    CloseWait,
    /// Both sides closed simultaneously, waiting for the final ack
    Closing,
    /// Waiting for acknowledgment of our close after the peer's
    LastAck,
    /// Connection fully shut down, draining stray segments
    TimeWait,
}

impl TcpState {
    /// Whether the protocol considers the connection torn down from the
    /// user's point of view (no further data transfer is possible).
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            TcpState::Closed
                | TcpState::CloseWait
                | TcpState::LastAck
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::TimeWait
        )
    }
}

// ============================================================================
// TCP Header
// ============================================================================

/// Parsed TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq_num: u32,
    /// Acknowledgment number (valid if ACK flag set)
    pub ack_num: u32,
    /// Data offset in 32-bit words (5-15)
    pub data_offset: u8,
    /// Control flags
    pub flags: u8,
    /// Receive window size
    pub window: u16,
    /// Checksum as received
    pub checksum: u16,
    /// Urgent pointer (valid if URG flag set)
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Header length in bytes.
    #[inline]
    pub fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    /// Check if SYN flag is set.
    #[inline]
    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    /// Check if ACK flag is set.
    #[inline]
    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    /// Check if FIN flag is set.
    #[inline]
    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    /// Check if RST flag is set.
    #[inline]
    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }
}

/// Errors from TCP segment parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// Segment is shorter than its header
    Truncated,
    /// Data offset below the minimum header size
    BadDataOffset,
    /// Checksum does not verify against the pseudo-header
    ChecksumMismatch,
}

/// Parse a TCP header from the start of `segment`.
///
/// Validates the data offset against both the minimum header size and the
/// available bytes. Options, if present, are left uninterpreted inside the
/// header area.
pub fn parse_tcp_header(segment: &[u8]) -> Result<TcpHeader, TcpError> {
    if segment.len() < TCP_HEADER_MIN_LEN {
        return Err(TcpError::Truncated);
    }

    let data_offset = segment[12] >> 4;
    if data_offset < 5 {
        return Err(TcpError::BadDataOffset);
    }
    if (data_offset as usize) * 4 > segment.len() {
        return Err(TcpError::Truncated);
    }

    Ok(TcpHeader {
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        seq_num: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        ack_num: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
        data_offset,
        flags: segment[13],
        window: u16::from_be_bytes([segment[14], segment[15]]),
        checksum: u16::from_be_bytes([segment[16], segment[17]]),
        urgent_ptr: u16::from_be_bytes([segment[18], segment[19]]),
    })
}

// ============================================================================
// TCP Checksum
// ============================================================================

/// Build the 12-byte pseudo-header for the given endpoints and TCP length.
fn pseudo_header(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_len: u16) -> [u8; 12] {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip.octets());
    pseudo[4..8].copy_from_slice(&dst_ip.octets());
    pseudo[9] = Ipv4Proto::Tcp.to_raw();
    pseudo[10..12].copy_from_slice(&tcp_len.to_be_bytes());
    pseudo
}

/// Compute the TCP checksum over pseudo-header, header, and payload.
///
/// `segment` is the complete TCP segment with its checksum field zeroed.
/// An odd trailing payload byte contributes as the high byte of a
/// zero-padded 16-bit word.
pub fn compute_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> u16 {
    let pseudo = pseudo_header(src_ip, dst_ip, segment.len() as u16);
    checksum_with_pseudo_header(&pseudo, segment)
}

/// Verify the checksum of a received TCP segment.
pub fn verify_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> bool {
    let pseudo = pseudo_header(src_ip, dst_ip, segment.len() as u16);
    checksum_with_pseudo_header(&pseudo, segment) == 0
}

// ============================================================================
// Segment Building
// ============================================================================

/// Build a complete TCP segment with its checksum filled in.
///
/// The acknowledgment field is written only when the ACK flag is present;
/// otherwise it stays zero on the wire.
pub fn build_tcp_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut segment = Vec::with_capacity(TCP_HEADER_MIN_LEN + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&seq_num.to_be_bytes());
    let effective_ack = if flags & TCP_FLAG_ACK != 0 { ack_num } else { 0 };
    segment.extend_from_slice(&effective_ack.to_be_bytes());
    // Data offset 5 words, no options
    segment.push(5 << 4);
    segment.push(flags);
    segment.extend_from_slice(&window.to_be_bytes());
    // Checksum placeholder
    segment.extend_from_slice(&[0, 0]);
    // Urgent pointer unused
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);

    let checksum = compute_tcp_checksum(src_ip, dst_ip, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
    segment
}

// ============================================================================
// Tests
// ============================================================================
