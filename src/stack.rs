//! The packet dispatch loop and protocol demultiplexer.
//!
//! # Architecture
//!
//! ```text
//!                     +------------------+
//!                     |    Adapters      |
//!                     | (lo, eth NICs)   |
//!                     +--------+---------+
//!                              |
//!                     +--------v---------+
//!                     |    Ethernet      |
//!                     |   classifier     |
//!                     +--------+---------+
//!                              |
//!              +---------------+---------------+
//!              |                               |
//!     +--------v---------+           +---------v--------+
//!     |      IPv4        |           |       ARP        |
//!     +--------+---------+           |  (table/reply)   |
//!              |                     +------------------+
//!     +--------+--------+--------+
//!     |        |        |        |
//!  +--v--+  +--v--+  +--v--+
//!  |ICMP |  | UDP |  | TCP |
//!  +-----+  +-----+  +-----+
//! ```
//!
//! A single dispatch task drains the adapters (loopback first) and parks
//! through the wait hooks when every queue is empty. The dispatcher never
//! returns errors; malformed or unroutable packets are logged, counted,
//! and dropped.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arp::{process_arp, ArpError, ArpResult, ArpStats};
use crate::buffer::KBuffer;
use crate::ethernet::{parse_ethernet, EthHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETH_HEADER_LEN};
use crate::icmp::{build_echo_reply, parse_icmp, parse_icmp_echo, IcmpError, ICMP_TYPE_ECHO_REQUEST};
use crate::ipv4::{parse_ipv4, Ipv4Addr, Ipv4Error, Ipv4Header, Ipv4Proto};
use crate::socket::{FourTuple, WaitOutcome};
use crate::tcp::{parse_tcp_header, verify_tcp_checksum, TcpError};
use crate::udp::{parse_udp, UdpError};
use crate::NetStack;

// ============================================================================
// Configuration
// ============================================================================

/// Address assigned to the first hardware adapter that comes up without one.
pub const DEFAULT_NIC_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 2);

/// Network stack configuration, consumed at startup.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    /// IPv4 address for the primary NIC
    pub address: Ipv4Addr,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            address: DEFAULT_NIC_ADDRESS,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Dispatcher statistics.
#[derive(Debug, Default)]
pub struct NetStats {
    /// Frames pulled off adapters
    pub rx_frames: AtomicU64,
    /// Frames or packets dropped anywhere in the inbound path
    pub rx_dropped: AtomicU64,
    /// IPv4 packets accepted by the classifier
    pub ipv4_rx: AtomicU64,
    /// ICMP segments received
    pub icmp_rx: AtomicU64,
    /// Echo replies transmitted
    pub icmp_echo_tx: AtomicU64,
    /// UDP datagrams received
    pub udp_rx: AtomicU64,
    /// UDP datagrams delivered to a socket
    pub udp_delivered: AtomicU64,
    /// TCP segments received
    pub tcp_rx: AtomicU64,
    /// TCP segments transmitted by sockets
    pub tcp_tx: AtomicU64,
    /// RST segments transmitted by the state machine
    pub tcp_rst_tx: AtomicU64,
    /// ARP statistics
    pub arp: ArpStats,
}

impl NetStats {
    pub const fn new() -> Self {
        NetStats {
            rx_frames: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            ipv4_rx: AtomicU64::new(0),
            icmp_rx: AtomicU64::new(0),
            icmp_echo_tx: AtomicU64::new(0),
            udp_rx: AtomicU64::new(0),
            udp_delivered: AtomicU64::new(0),
            tcp_rx: AtomicU64::new(0),
            tcp_tx: AtomicU64::new(0),
            tcp_rst_tx: AtomicU64::new(0),
            arp: ArpStats::new(),
        }
    }

    #[inline]
    fn inc_rx_frames(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_ipv4_rx(&self) {
        self.ipv4_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_icmp_rx(&self) {
        self.icmp_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_icmp_echo_tx(&self) {
        self.icmp_echo_tx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_udp_rx(&self) {
        self.udp_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_udp_delivered(&self) {
        self.udp_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_tcp_rx(&self) {
        self.tcp_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_tcp_tx(&self) {
        self.tcp_tx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_tcp_rst_tx(&self) {
        self.tcp_rst_tx.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Processing Result
// ============================================================================

/// What became of one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Frame was consumed (possibly generating replies)
    Handled,
    /// Frame was dropped with reason
    Dropped(DropReason),
}

/// Reason for dropping an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Smaller than an Ethernet header
    FrameTooShort,
    /// EtherType we do not speak
    UnknownEtherType,
    /// IPv4 protocol we do not speak
    UnknownProtocol,
    /// Destination address owned by no adapter
    NotOurAddress,
    /// ARP processing error
    Arp(ArpError),
    /// IPv4 parsing/validation error
    Ipv4(Ipv4Error),
    /// ICMP parsing error
    Icmp(IcmpError),
    /// UDP parsing error
    Udp(UdpError),
    /// TCP parsing/validation error
    Tcp(TcpError),
    /// No UDP socket bound to the destination port
    NoListener,
    /// No TCP socket registered for the four-tuple
    NoSocket,
    /// Segment does not acknowledge our current sequence number
    AckMismatch,
}

// ============================================================================
// Frame Processing
// ============================================================================

/// Process one inbound Ethernet frame.
///
/// This is the dispatcher's entry point: classify by EtherType and hand the
/// payload to ARP or to the IPv4 protocol switch.
pub fn process_frame(stack: &NetStack, frame: &[u8]) -> ProcessResult {
    let stats = stack.stats();
    stats.inc_rx_frames();

    let result = classify_frame(stack, frame);
    if let ProcessResult::Dropped(reason) = result {
        stats.inc_rx_dropped();
        log::debug!("net: dropped frame: {:?}", reason);
    }
    result
}

fn classify_frame(stack: &NetStack, frame: &[u8]) -> ProcessResult {
    if frame.len() < ETH_HEADER_LEN {
        log::warn!("net: frame too small to be Ethernet ({} bytes)", frame.len());
        return ProcessResult::Dropped(DropReason::FrameTooShort);
    }

    let (eth, payload) = match parse_ethernet(frame) {
        Ok(parsed) => parsed,
        Err(_) => return ProcessResult::Dropped(DropReason::FrameTooShort),
    };

    match eth.ethertype {
        ETHERTYPE_ARP => {
            match process_arp(
                payload,
                stack.adapters(),
                stack.arp_table(),
                &stack.stats().arp,
            ) {
                ArpResult::Handled | ArpResult::Replied => ProcessResult::Handled,
                ArpResult::Dropped(e) => ProcessResult::Dropped(DropReason::Arp(e)),
            }
        }
        ETHERTYPE_IPV4 => process_ipv4(stack, &eth, payload),
        other => {
            log::trace!("net: ignoring EtherType {:#06x}", other);
            ProcessResult::Dropped(DropReason::UnknownEtherType)
        }
    }
}

fn process_ipv4(stack: &NetStack, eth: &EthHeader, packet: &[u8]) -> ProcessResult {
    let (ip, ip_payload) = match parse_ipv4(packet) {
        Ok(parsed) => parsed,
        Err(e) => return ProcessResult::Dropped(DropReason::Ipv4(e)),
    };
    stack.stats().inc_ipv4_rx();

    // The exact packet (header + payload, no link padding) for delivery copies
    let packet_bytes = &packet[..ip.total_len as usize];

    match ip.proto() {
        Some(Ipv4Proto::Icmp) => handle_icmp(stack, eth, &ip, ip_payload, packet_bytes),
        Some(Ipv4Proto::Udp) => handle_udp(stack, &ip, ip_payload, packet_bytes),
        Some(Ipv4Proto::Tcp) => handle_tcp(stack, &ip, ip_payload, packet_bytes),
        None => {
            log::debug!("ipv4: unhandled protocol {}", ip.protocol);
            ProcessResult::Dropped(DropReason::UnknownProtocol)
        }
    }
}

/// ICMP: fan a copy of the packet out to every ICMP socket, then answer
/// echo requests addressed to one of our adapters.
fn handle_icmp(
    stack: &NetStack,
    eth: &EthHeader,
    ip: &Ipv4Header,
    segment: &[u8],
    packet_bytes: &[u8],
) -> ProcessResult {
    stack.stats().inc_icmp_rx();

    let (header, _rest) = match parse_icmp(segment) {
        Ok(parsed) => parsed,
        Err(e) => return ProcessResult::Dropped(DropReason::Icmp(e)),
    };

    for socket in stack.sockets().icmp_receivers() {
        socket.did_receive(ip.src, 0, KBuffer::copy(packet_bytes));
    }

    let adapter = match stack.adapters().from_ipv4_address(ip.dst) {
        Some(a) => a,
        None => return ProcessResult::Handled,
    };

    if header.icmp_type == ICMP_TYPE_ECHO_REQUEST {
        if let Ok(echo) = parse_icmp_echo(segment) {
            log::debug!(
                "icmp: echo request from {}: id={} seq={}",
                ip.src,
                echo.identifier,
                echo.sequence_number
            );
        }
        let reply = match build_echo_reply(segment) {
            Ok(r) => r,
            Err(e) => return ProcessResult::Dropped(DropReason::Icmp(e)),
        };
        // Reply straight back to the frame source
        adapter
            .lock()
            .send_ipv4(eth.src, ip.src, Ipv4Proto::Icmp, &reply);
        stack.stats().inc_icmp_echo_tx();
    }

    ProcessResult::Handled
}

/// UDP: route by destination port through the global port table.
fn handle_udp(
    stack: &NetStack,
    ip: &Ipv4Header,
    segment: &[u8],
    packet_bytes: &[u8],
) -> ProcessResult {
    stack.stats().inc_udp_rx();

    if stack.adapters().from_ipv4_address(ip.dst).is_none() {
        log::debug!("udp: packet is not for me, it's for {}", ip.dst);
        return ProcessResult::Dropped(DropReason::NotOurAddress);
    }

    let (header, _payload) = match parse_udp(segment) {
        Ok(parsed) => parsed,
        Err(e) => return ProcessResult::Dropped(DropReason::Udp(e)),
    };

    let socket = match stack.sockets().udp_from_port(header.dst_port) {
        Some(s) => s,
        None => {
            log::debug!("udp: no socket for port {}", header.dst_port);
            return ProcessResult::Dropped(DropReason::NoListener);
        }
    };
    debug_assert_eq!(socket.local_port(), header.dst_port);

    socket.did_receive(ip.src, header.src_port, KBuffer::copy(packet_bytes));
    stack.stats().inc_udp_delivered();
    ProcessResult::Handled
}

/// TCP: validate, look up the connection by four-tuple, and hand the
/// segment to its state machine.
fn handle_tcp(
    stack: &NetStack,
    ip: &Ipv4Header,
    segment: &[u8],
    packet_bytes: &[u8],
) -> ProcessResult {
    stack.stats().inc_tcp_rx();

    if stack.adapters().from_ipv4_address(ip.dst).is_none() {
        log::debug!("tcp: packet is not for me, it's for {}", ip.dst);
        return ProcessResult::Dropped(DropReason::NotOurAddress);
    }

    let tcp = match parse_tcp_header(segment) {
        Ok(parsed) => parsed,
        Err(e) => return ProcessResult::Dropped(DropReason::Tcp(e)),
    };
    if !verify_tcp_checksum(ip.src, ip.dst, segment) {
        return ProcessResult::Dropped(DropReason::Tcp(TcpError::ChecksumMismatch));
    }

    let payload_size = ip.payload_len() - tcp.header_len();

    let tuple = FourTuple::new(ip.dst, tcp.dst_port, ip.src, tcp.src_port);
    let socket = match stack.sockets().from_tuple(&tuple) {
        Some(s) => s,
        None => {
            log::debug!("tcp: no socket for tuple {}", tuple);
            return ProcessResult::Dropped(DropReason::NoSocket);
        }
    };
    debug_assert_eq!(socket.local_port(), tcp.dst_port);

    let packet = KBuffer::copy(packet_bytes);
    match socket.segment_arrived(
        &packet,
        ip.src,
        tcp.src_port,
        tcp.seq_num,
        tcp.ack_num,
        tcp.flags,
        payload_size,
    ) {
        None => ProcessResult::Handled,
        Some(reason) => ProcessResult::Dropped(reason),
    }
}

// ============================================================================
// Dispatch Loop
// ============================================================================

/// Drain and process at most one frame. Returns whether a frame was seen.
pub fn poll_once(stack: &NetStack) -> bool {
    match stack.adapters().dequeue_packet() {
        Some(frame) => {
            process_frame(stack, &frame);
            true
        }
        None => false,
    }
}

/// The dispatch task body: drain adapters, park while everything is idle.
///
/// Runs until the stack's dispatch wait queue is closed. Without registered
/// wait hooks the loop degrades to polling.
pub fn run_dispatch_loop(stack: &NetStack) {
    log::info!("net: dispatch task entering main loop");
    loop {
        if poll_once(stack) {
            continue;
        }
        if stack.adapters().has_queued_packets() {
            continue;
        }
        match stack.dispatch_wait().wait() {
            WaitOutcome::Closed => {
                log::info!("net: dispatch task shutting down");
                return;
            }
            WaitOutcome::Woken | WaitOutcome::Interrupted | WaitOutcome::TimedOut => continue,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackAdapter;
    use crate::ethernet::EthAddr;
    use crate::icmp::{build_echo_request, parse_icmp_echo, ICMP_TYPE_ECHO_REPLY};
    use crate::socket::{IcmpSocket, ShouldBlock, SocketError, TcpSocket, UdpSocket};
    use crate::tcp::{
        build_tcp_segment, TcpState, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST,
        TCP_FLAG_SYN,
    };
    use crate::testutil::{
        ipv4_frame, sent_tcp_segments, test_stack_with_adapter, TxLog, PEER_MAC,
    };
    use crate::udp::build_udp_datagram;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

    /// Inject a TCP segment from the peer into the stack.
    fn inject_tcp(
        stack: &NetStack,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
        local_port: u16,
    ) -> ProcessResult {
        let segment = build_tcp_segment(PEER, LOCAL, 80, local_port, seq, ack, flags, 64240, payload);
        let frame = ipv4_frame(PEER, LOCAL, Ipv4Proto::Tcp, &segment);
        process_frame(stack, &frame)
    }

    /// Bring a bound socket to Established: connect, then answer the SYN.
    fn establish(stack: &Arc<NetStack>, tx: &TxLog) -> Arc<TcpSocket> {
        let socket = TcpSocket::create(stack);
        socket.bind(LOCAL, 49152).unwrap();
        assert_eq!(
            socket.connect(PEER, 80, ShouldBlock::No).unwrap_err(),
            SocketError::InProgress
        );
        assert_eq!(
            inject_tcp(stack, 1000, 1, TCP_FLAG_SYN | TCP_FLAG_ACK, &[], 49152),
            ProcessResult::Handled
        );
        assert_eq!(socket.state(), TcpState::Established);
        assert!(socket.is_connected());
        // SYN + handshake ACK
        assert_eq!(sent_tcp_segments(tx).len(), 2);
        socket
    }

    #[test]
    fn test_active_open_handshake() {
        let (stack, tx) = test_stack_with_adapter(LOCAL);
        let socket = TcpSocket::create(&stack);
        socket.bind(LOCAL, 49152).unwrap();
        assert_eq!(
            socket.connect(PEER, 80, ShouldBlock::No).unwrap_err(),
            SocketError::InProgress
        );

        let segments = sent_tcp_segments(&tx);
        assert_eq!(segments.len(), 1);
        let (syn, _) = &segments[0];
        assert_eq!(syn.flags, TCP_FLAG_SYN);
        assert_eq!(syn.seq_num, 0);
        assert_eq!(syn.ack_num, 0);
        assert_eq!(syn.src_port, 49152);
        assert_eq!(syn.dst_port, 80);
        assert_eq!(syn.window, 1024);

        assert_eq!(
            inject_tcp(&stack, 1000, 1, TCP_FLAG_SYN | TCP_FLAG_ACK, &[], 49152),
            ProcessResult::Handled
        );

        let segments = sent_tcp_segments(&tx);
        assert_eq!(segments.len(), 2);
        let (ack, _) = &segments[1];
        assert_eq!(ack.flags, TCP_FLAG_ACK);
        assert_eq!(ack.seq_num, 1);
        assert_eq!(ack.ack_num, 1001);

        assert_eq!(socket.state(), TcpState::Established);
        assert!(socket.is_connected());
    }

    #[test]
    fn test_data_transfer() {
        let (stack, tx) = test_stack_with_adapter(LOCAL);
        let socket = establish(&stack, &tx);

        // Outbound: two bytes as PUSH|ACK, sequence space consumed
        assert_eq!(socket.send(b"hi").unwrap(), 2);
        let segments = sent_tcp_segments(&tx);
        let (push, payload) = &segments[2];
        assert_eq!(push.flags, TCP_FLAG_PSH | TCP_FLAG_ACK);
        assert_eq!(push.seq_num, 1);
        assert_eq!(push.ack_num, 1001);
        assert_eq!(payload.as_slice(), b"hi");
        assert_eq!(socket.sequence_number(), 3);

        // Inbound: peer acks our data and sends two bytes of its own
        assert_eq!(
            inject_tcp(&stack, 1001, 3, TCP_FLAG_ACK, b"ok", 49152),
            ProcessResult::Handled
        );
        let segments = sent_tcp_segments(&tx);
        let (ack, _) = &segments[3];
        assert_eq!(ack.flags, TCP_FLAG_ACK);
        assert_eq!(ack.seq_num, 3);
        assert_eq!(ack.ack_num, 1003);

        let mut buf = [0u8; 16];
        assert_eq!(socket.receive(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");
    }

    #[test]
    fn test_peer_close() {
        let (stack, tx) = test_stack_with_adapter(LOCAL);
        let socket = establish(&stack, &tx);
        socket.send(b"hi").unwrap();
        inject_tcp(&stack, 1001, 3, TCP_FLAG_ACK, b"ok", 49152);

        // Peer sends FIN; we ack the flag octet and fall out of Established
        assert_eq!(
            inject_tcp(&stack, 1003, 3, TCP_FLAG_FIN, &[], 49152),
            ProcessResult::Handled
        );
        let segments = sent_tcp_segments(&tx);
        let (ack, _) = segments.last().unwrap();
        assert_eq!(ack.flags, TCP_FLAG_ACK);
        assert_eq!(ack.seq_num, 3);
        assert_eq!(ack.ack_num, 1004);

        assert_eq!(socket.state(), TcpState::CloseWait);
        assert!(!socket.is_connected());
        assert!(socket.is_protocol_disconnected());
    }

    #[test]
    fn test_unexpected_syn_in_established_acts_as_data() {
        let (stack, tx) = test_stack_with_adapter(LOCAL);
        let socket = establish(&stack, &tx);

        // A lone SYN with a correct ack number takes the data branch: the
        // ack tracks seq + payload (zero) and the connection survives.
        assert_eq!(
            inject_tcp(&stack, 5000, 1, TCP_FLAG_SYN, &[], 49152),
            ProcessResult::Handled
        );
        let segments = sent_tcp_segments(&tx);
        let (ack, _) = segments.last().unwrap();
        assert_eq!(ack.flags, TCP_FLAG_ACK);
        assert_eq!(ack.ack_num, 5000);
        assert_eq!(socket.state(), TcpState::Established);
        assert!(socket.is_connected());
    }

    #[test]
    fn test_ack_mismatch_is_dropped() {
        let (stack, tx) = test_stack_with_adapter(LOCAL);
        let socket = TcpSocket::create(&stack);
        socket.bind(LOCAL, 49152).unwrap();
        let _ = socket.connect(PEER, 80, ShouldBlock::No);

        // ack 99 does not match our sequence number (1 after the SYN)
        assert_eq!(
            inject_tcp(&stack, 1000, 99, TCP_FLAG_SYN | TCP_FLAG_ACK, &[], 49152),
            ProcessResult::Dropped(DropReason::AckMismatch)
        );
        assert_eq!(socket.state(), TcpState::SynSent);
        assert_eq!(sent_tcp_segments(&tx).len(), 1);
    }

    #[test]
    fn test_unknown_tuple_is_dropped() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL);
        assert_eq!(
            inject_tcp(&stack, 0, 0, TCP_FLAG_SYN, &[], 4444),
            ProcessResult::Dropped(DropReason::NoSocket)
        );
    }

    #[test]
    fn test_active_close_full_teardown() {
        let (stack, tx) = test_stack_with_adapter(LOCAL);
        let socket = establish(&stack, &tx);

        socket.close().unwrap();
        let segments = sent_tcp_segments(&tx);
        let (fin, _) = segments.last().unwrap();
        assert_eq!(fin.flags, TCP_FLAG_FIN | TCP_FLAG_ACK);
        assert_eq!(socket.state(), TcpState::FinWait1);

        // Peer acks our FIN (the protocol acks what we have sent: seq 1)
        inject_tcp(&stack, 1001, 1, TCP_FLAG_ACK, &[], 49152);
        assert_eq!(socket.state(), TcpState::FinWait2);

        // Peer's own FIN moves us to TimeWait
        inject_tcp(&stack, 1002, 1, TCP_FLAG_FIN, &[], 49152);
        assert_eq!(socket.state(), TcpState::TimeWait);

        // Anything after that draws a RST
        inject_tcp(&stack, 1003, 1, TCP_FLAG_ACK, &[], 49152);
        let segments = sent_tcp_segments(&tx);
        let (rst, _) = segments.last().unwrap();
        assert_eq!(rst.flags, TCP_FLAG_RST);
        assert_eq!(socket.state(), TcpState::Closed);
        assert_eq!(stack.stats().tcp_rst_tx.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unexpected_flags_in_close_wait_reset() {
        let (stack, tx) = test_stack_with_adapter(LOCAL);
        let socket = establish(&stack, &tx);
        inject_tcp(&stack, 1001, 1, TCP_FLAG_FIN, &[], 49152);
        assert_eq!(socket.state(), TcpState::CloseWait);

        inject_tcp(&stack, 1002, 1, TCP_FLAG_ACK, &[], 49152);
        let segments = sent_tcp_segments(&tx);
        let (rst, _) = segments.last().unwrap();
        assert_eq!(rst.flags, TCP_FLAG_RST);
        assert_eq!(socket.state(), TcpState::Closed);
    }

    #[test]
    fn test_corrupt_tcp_checksum_is_dropped() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL);
        let socket = TcpSocket::create(&stack);
        socket.bind(LOCAL, 49152).unwrap();
        let _ = socket.connect(PEER, 80, ShouldBlock::No);

        let mut segment =
            build_tcp_segment(PEER, LOCAL, 80, 49152, 1000, 1, TCP_FLAG_SYN | TCP_FLAG_ACK, 64240, &[]);
        segment[16] ^= 0xff;
        let frame = ipv4_frame(PEER, LOCAL, Ipv4Proto::Tcp, &segment);
        assert_eq!(
            process_frame(&stack, &frame),
            ProcessResult::Dropped(DropReason::Tcp(TcpError::ChecksumMismatch))
        );
        assert_eq!(socket.state(), TcpState::SynSent);
    }

    #[test]
    fn test_icmp_echo_request_answered_and_fanned_out() {
        let (stack, tx) = test_stack_with_adapter(LOCAL);
        let listener = IcmpSocket::create(&stack);

        let request = build_echo_request(0x1234, 7, b"ping!");
        let frame = ipv4_frame(PEER, LOCAL, Ipv4Proto::Icmp, &request);
        assert_eq!(process_frame(&stack, &frame), ProcessResult::Handled);

        // Fan-out delivered a copy of the whole IPv4 packet
        assert_eq!(listener.queued_packets(), 1);
        let mut buf = [0u8; 128];
        let (size, from) = listener.receive(&mut buf).unwrap();
        assert_eq!(from, PEER);
        let (ip, _) = parse_ipv4(&buf[..size]).unwrap();
        assert_eq!(ip.proto(), Some(Ipv4Proto::Icmp));

        // The reply went back to the frame source, swapped addresses
        let sent = tx.lock();
        let reply_frame = sent.last().unwrap();
        assert_eq!(reply_frame.dst_mac, PEER_MAC);
        let (ip, icmp_bytes) = parse_ipv4(&reply_frame.payload).unwrap();
        assert_eq!(ip.dst, PEER);
        assert_eq!(icmp_bytes[0], ICMP_TYPE_ECHO_REPLY);
        let echo = parse_icmp_echo(icmp_bytes).unwrap();
        assert_eq!(echo.identifier, 0x1234);
        assert_eq!(echo.sequence_number, 7);
        assert_eq!(&icmp_bytes[8..], b"ping!");
    }

    #[test]
    fn test_icmp_for_foreign_address_only_fans_out() {
        let (stack, tx) = test_stack_with_adapter(LOCAL);
        let listener = IcmpSocket::create(&stack);

        let request = build_echo_request(1, 1, b"x");
        let frame = ipv4_frame(PEER, Ipv4Addr::new(10, 0, 0, 99), Ipv4Proto::Icmp, &request);
        assert_eq!(process_frame(&stack, &frame), ProcessResult::Handled);

        // Delivered to the socket, but no reply for an address we don't own
        assert_eq!(listener.queued_packets(), 1);
        assert!(tx.lock().is_empty());
    }

    #[test]
    fn test_udp_delivery_by_port() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL);
        let socket = UdpSocket::create(&stack);
        socket.bind(53).unwrap();

        let datagram = build_udp_datagram(PEER, LOCAL, 5353, 53, b"query");
        let frame = ipv4_frame(PEER, LOCAL, Ipv4Proto::Udp, &datagram);
        assert_eq!(process_frame(&stack, &frame), ProcessResult::Handled);

        let mut buf = [0u8; 64];
        let (size, from_ip, from_port) = socket.receive(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"query");
        assert_eq!(from_ip, PEER);
        assert_eq!(from_port, 5353);
        assert_eq!(stack.stats().udp_delivered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_udp_unbound_port_is_dropped() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL);
        let datagram = build_udp_datagram(PEER, LOCAL, 5353, 9999, b"void");
        let frame = ipv4_frame(PEER, LOCAL, Ipv4Proto::Udp, &datagram);
        assert_eq!(
            process_frame(&stack, &frame),
            ProcessResult::Dropped(DropReason::NoListener)
        );
    }

    #[test]
    fn test_short_and_unknown_frames_dropped() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL);

        assert_eq!(
            process_frame(&stack, &[0u8; 10]),
            ProcessResult::Dropped(DropReason::FrameTooShort)
        );

        let mut frame = Vec::new();
        frame.extend_from_slice(&[0u8; 12]);
        frame.extend_from_slice(&0x86ddu16.to_be_bytes()); // IPv6
        frame.extend_from_slice(&[0u8; 40]);
        assert_eq!(
            process_frame(&stack, &frame),
            ProcessResult::Dropped(DropReason::UnknownEtherType)
        );
        assert_eq!(stack.stats().rx_dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_loopback_poll_roundtrip() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL);
        let lo = stack.register_device(LoopbackAdapter::new());

        let socket = UdpSocket::create(&stack);
        socket.bind(7).unwrap();

        // Nothing queued yet
        assert!(!poll_once(&stack));

        let datagram = build_udp_datagram(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 9, 7, b"echo");
        lo.lock().send_ipv4(
            EthAddr::ZERO,
            Ipv4Addr::LOCALHOST,
            Ipv4Proto::Udp,
            &datagram,
        );

        assert!(stack.adapters().has_queued_packets());
        assert!(poll_once(&stack));

        let mut buf = [0u8; 16];
        let (size, _, _) = socket.receive(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"echo");
    }
}
