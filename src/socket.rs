//! Sockets, the four-tuple registry, and the TCP connection state machine.
//!
//! # Architecture
//!
//! The registry ([`SocketTable`]) holds weak back-references only; strong
//! handles are materialized while the registry lock is held and the lock is
//! released before any further work. A TCP socket removes its own entry on
//! destruction, so a registered socket appears exactly once under its
//! current tuple for its whole lifetime.
//!
//! Blocking is delegated to the kernel scheduler through [`NetWaitHooks`]:
//! the crate owns the wait condition ([`WaitQueue`]), the kernel owns the
//! parking. Without registered hooks every wait degrades to a non-blocking
//! poll, which is what keeps this crate testable on a host.
//!
//! # TCP state machine
//!
//! Inbound segments are classified by `(state, flags)` with exact flag
//! matching. Any combination without a row resets the connection (RST out,
//! state Closed); the exceptions are Listen, which silently ignores
//! unexpected frames, and Established, which treats every non-FIN segment
//! as data transfer.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Mutex, Once};

use crate::buffer::KBuffer;
use crate::device::AdapterRef;
use crate::ethernet::EthAddr;
use crate::ipv4::{parse_ipv4, Ipv4Addr, Ipv4Proto};
use crate::stack::DropReason;
use crate::tcp::{
    build_tcp_segment, parse_tcp_header, TcpState, TCP_ADVERTISED_WINDOW, TCP_FLAG_ACK,
    TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN,
};
use crate::NetStack;

// ============================================================================
// Constants
// ============================================================================

/// First ephemeral port.
pub const EPHEMERAL_PORT_FIRST: u16 = 32768;

/// Last ephemeral port (inclusive).
pub const EPHEMERAL_PORT_LAST: u16 = 60999;

/// Maximum queued inbound packets per socket; later arrivals are dropped.
const MAX_RX_QUEUE: usize = 64;

// ============================================================================
// Wait Primitives (Scheduler Integration)
// ============================================================================

/// Wait operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Waiter was explicitly woken
    Woken,
    /// A signal interrupted the wait
    Interrupted,
    /// Queue was closed while waiting
    Closed,
    /// No blocking support; caller should poll
    TimedOut,
}

/// Scheduler hooks for blocking waits.
///
/// The kernel registers an implementation once at startup. The dispatch
/// task parks through these hooks while all adapter queues are empty, and
/// a user task parks inside a blocking `connect`. Implementations must not
/// hold any stack lock while parked.
pub trait NetWaitHooks: Send + Sync {
    /// Block the current task until woken, interrupted by a signal, or the
    /// queue is closed.
    fn wait(&self, queue: &WaitQueue) -> WaitOutcome;

    /// Wake one waiter blocked on `queue`.
    fn wake_one(&self, queue: &WaitQueue);

    /// Wake all waiters blocked on `queue`.
    fn wake_all(&self, queue: &WaitQueue);
}

static NET_WAIT_HOOKS: Once<&'static dyn NetWaitHooks> = Once::new();

/// Register scheduler hooks. The first registration wins.
pub fn register_net_wait_hooks(hooks: &'static dyn NetWaitHooks) {
    NET_WAIT_HOOKS.call_once(|| hooks);
}

#[inline]
fn net_wait_hooks() -> Option<&'static dyn NetWaitHooks> {
    NET_WAIT_HOOKS.get().copied()
}

/// A wait condition keyed on one resource (a socket, the dispatch task).
///
/// The queue itself only tracks closure and pending wake-ups; parking is
/// delegated to the registered [`NetWaitHooks`]. A wake-up that arrives
/// before the waiter parks is consumed by the next `wait` call, so the
/// signal cannot be lost.
pub struct WaitQueue {
    closed: AtomicBool,
    wakeup_count: AtomicU64,
}

impl WaitQueue {
    /// Create an open queue.
    pub const fn new() -> Self {
        WaitQueue {
            closed: AtomicBool::new(false),
            wakeup_count: AtomicU64::new(0),
        }
    }

    /// Wait until woken, interrupted, or closed.
    ///
    /// Returns [`WaitOutcome::TimedOut`] immediately when no hooks are
    /// registered.
    pub fn wait(&self) -> WaitOutcome {
        if self.closed.load(Ordering::Acquire) {
            return WaitOutcome::Closed;
        }

        // Consume a wake that arrived before we parked.
        if self
            .wakeup_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then(|| current - 1)
            })
            .is_ok()
        {
            return WaitOutcome::Woken;
        }

        match net_wait_hooks() {
            Some(hooks) => hooks.wait(self),
            None => WaitOutcome::TimedOut,
        }
    }

    /// Signal one waiter.
    pub fn wake_one(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Release);
        if let Some(hooks) = net_wait_hooks() {
            hooks.wake_one(self);
        }
    }

    /// Signal all waiters.
    pub fn wake_all(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Release);
        if let Some(hooks) = net_wait_hooks() {
            hooks.wake_all(self);
        }
    }

    /// Close the queue and fail all future waits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Check if closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Entropy
// ============================================================================

/// Source of random values, registered by the kernel at startup.
pub trait EntropySource: Send + Sync {
    fn random_u32(&self) -> u32;
}

static ENTROPY_SOURCE: Once<&'static dyn EntropySource> = Once::new();

/// Register the system entropy source. The first registration wins.
pub fn register_entropy_source(source: &'static dyn EntropySource) {
    ENTROPY_SOURCE.call_once(|| source);
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn cycle_counter() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn cycle_counter() -> u64 {
    0xa5a5_5a5a_d3e4_c7d2
}

/// Mix the cycle counter with a running counter for unpredictable output.
/// Not cryptographic; only the fallback when no entropy source exists.
fn fallback_random_u32() -> u32 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let tsc = cycle_counter();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut v0 = tsc.wrapping_add(counter);
    let mut v1 = (tsc ^ counter).rotate_left(17);
    v0 = v0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    v1 ^= v0.rotate_left(23);
    v1 = v1.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    v0 ^= v1.rotate_left(41);

    let mixed = v0 ^ v1;
    (mixed ^ (mixed >> 32)) as u32
}

pub(crate) fn random_u32() -> u32 {
    match ENTROPY_SOURCE.get() {
        Some(source) => source.random_u32(),
        None => fallback_random_u32(),
    }
}

// ============================================================================
// Four-Tuple
// ============================================================================

/// The pair of endpoints identifying a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourTuple {
    /// Local IP address
    pub local_ip: Ipv4Addr,
    /// Local port
    pub local_port: u16,
    /// Peer IP address
    pub peer_ip: Ipv4Addr,
    /// Peer port
    pub peer_port: u16,
}

impl FourTuple {
    /// Create a tuple from its four fields.
    pub const fn new(local_ip: Ipv4Addr, local_port: u16, peer_ip: Ipv4Addr, peer_port: u16) -> Self {
        FourTuple {
            local_ip,
            local_port,
            peer_ip,
            peer_port,
        }
    }
}

impl core::fmt::Display for FourTuple {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.local_ip, self.local_port, self.peer_ip, self.peer_port
        )
    }
}

// ============================================================================
// Socket Errors
// ============================================================================

/// Socket operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Tuple or port already registered, or ephemeral range exhausted
    AddressInUse,
    /// Local address is owned by no adapter
    AddressNotAvailable,
    /// No route to the peer
    HostUnreachable,
    /// A signal interrupted a blocking operation
    Interrupted,
    /// Non-blocking connect handed off to the state machine
    InProgress,
    /// Data transfer attempted without an established connection
    NotConnected,
    /// The connection was reset while an operation was in flight
    ConnectionReset,
    /// The owning adapter is gone
    NetworkDown,
    /// No buffered packet to receive
    WouldBlock,
}

// ============================================================================
// Receive Buffering
// ============================================================================

/// One packet delivered to a socket: source endpoint plus a shared copy of
/// the full IPv4 packet (header included).
pub struct ReceivedPacket {
    /// Source IP address
    pub source_ip: Ipv4Addr,
    /// Source port (0 for ICMP)
    pub source_port: u16,
    /// The IPv4 packet, header and payload
    pub buffer: KBuffer,
}

/// Bounded inbound packet queue shared by all socket flavors.
struct ReceiveQueue {
    packets: Mutex<VecDeque<ReceivedPacket>>,
}

impl ReceiveQueue {
    const fn new() -> Self {
        ReceiveQueue {
            packets: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, packet: ReceivedPacket) {
        let mut packets = self.packets.lock();
        if packets.len() >= MAX_RX_QUEUE {
            log::warn!("socket: receive queue full, dropping packet");
            return;
        }
        packets.push_back(packet);
    }

    fn pop(&self) -> Option<ReceivedPacket> {
        self.packets.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.packets.lock().len()
    }
}

// ============================================================================
// UDP Socket
// ============================================================================

/// A datagram socket bound to a local port.
pub struct UdpSocket {
    stack: Arc<NetStack>,
    weak_self: Weak<UdpSocket>,
    local_port: Mutex<u16>,
    rx: ReceiveQueue,
}

impl UdpSocket {
    /// Create an unbound socket.
    pub fn create(stack: &Arc<NetStack>) -> Arc<UdpSocket> {
        Arc::new_cyclic(|weak| UdpSocket {
            stack: stack.clone(),
            weak_self: weak.clone(),
            local_port: Mutex::new(0),
            rx: ReceiveQueue::new(),
        })
    }

    /// Bind to `port` and enter the port registry.
    pub fn bind(&self, port: u16) -> Result<(), SocketError> {
        self.stack
            .sockets()
            .bind_udp(port, self.weak_self.clone())?;
        *self.local_port.lock() = port;
        Ok(())
    }

    /// The bound port, 0 if unbound.
    pub fn local_port(&self) -> u16 {
        *self.local_port.lock()
    }

    /// Queue an inbound packet. Called by the dispatcher.
    pub(crate) fn did_receive(&self, source_ip: Ipv4Addr, source_port: u16, buffer: KBuffer) {
        self.rx.push(ReceivedPacket {
            source_ip,
            source_port,
            buffer,
        });
    }

    /// Deliver the payload of the next buffered datagram into `buf`.
    ///
    /// Returns the payload size and source endpoint. `buf` must be at least
    /// as large as the payload.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr, u16), SocketError> {
        let packet = self.rx.pop().ok_or(SocketError::WouldBlock)?;
        let (_ip, ip_payload) =
            parse_ipv4(packet.buffer.as_slice()).map_err(|_| SocketError::WouldBlock)?;
        let (_udp, payload) =
            crate::udp::parse_udp(ip_payload).map_err(|_| SocketError::WouldBlock)?;
        assert!(buf.len() >= payload.len());
        buf[..payload.len()].copy_from_slice(payload);
        Ok((payload.len(), packet.source_ip, packet.source_port))
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        let port = *self.local_port.get_mut();
        if port != 0 {
            self.stack.sockets().unbind_udp(port);
        }
    }
}

// ============================================================================
// ICMP Socket
// ============================================================================

/// A raw ICMP socket. Every inbound ICMP packet is copied to every live
/// ICMP socket, without address filtering.
pub struct IcmpSocket {
    rx: ReceiveQueue,
}

impl IcmpSocket {
    /// Create and register with the stack's socket set.
    pub fn create(stack: &Arc<NetStack>) -> Arc<IcmpSocket> {
        let socket = Arc::new(IcmpSocket {
            rx: ReceiveQueue::new(),
        });
        stack.sockets().register_icmp(Arc::downgrade(&socket));
        socket
    }

    pub(crate) fn did_receive(&self, source_ip: Ipv4Addr, source_port: u16, buffer: KBuffer) {
        self.rx.push(ReceivedPacket {
            source_ip,
            source_port,
            buffer,
        });
    }

    /// Deliver the next buffered IPv4 packet (header included) into `buf`.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr), SocketError> {
        let packet = self.rx.pop().ok_or(SocketError::WouldBlock)?;
        let bytes = packet.buffer.as_slice();
        assert!(buf.len() >= bytes.len());
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok((bytes.len(), packet.source_ip))
    }

    /// Number of buffered packets.
    pub fn queued_packets(&self) -> usize {
        self.rx.len()
    }
}

// ============================================================================
// TCP Socket
// ============================================================================

/// Whether `connect` should park the caller until the handshake finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldBlock {
    Yes,
    No,
}

struct TcpInner {
    tuple: FourTuple,
    state: TcpState,
    sequence_number: u32,
    ack_number: u32,
    connected: bool,
    registered: bool,
    adapter: Option<AdapterRef>,
}

/// A connection-oriented stream socket.
///
/// All mutable state sits behind one lock; the lock is never held across a
/// blocking wait. The socket owns a weak reference to its adapter, resolved
/// lazily on bind or connect.
pub struct TcpSocket {
    stack: Arc<NetStack>,
    weak_self: Weak<TcpSocket>,
    inner: Mutex<TcpInner>,
    rx: ReceiveQueue,
    connect_wait: WaitQueue,
}

impl TcpSocket {
    /// Create a socket in the Closed state.
    pub fn create(stack: &Arc<NetStack>) -> Arc<TcpSocket> {
        Arc::new_cyclic(|weak| TcpSocket {
            stack: stack.clone(),
            weak_self: weak.clone(),
            inner: Mutex::new(TcpInner {
                tuple: FourTuple::new(Ipv4Addr::UNSPECIFIED, 0, Ipv4Addr::UNSPECIFIED, 0),
                state: TcpState::Closed,
                sequence_number: 0,
                ack_number: 0,
                connected: false,
                registered: false,
                adapter: None,
            }),
            rx: ReceiveQueue::new(),
            connect_wait: WaitQueue::new(),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> TcpState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn sequence_number(&self) -> u32 {
        self.inner.lock().sequence_number
    }

    pub fn ack_number(&self) -> u32 {
        self.inner.lock().ack_number
    }

    pub fn tuple(&self) -> FourTuple {
        self.inner.lock().tuple
    }

    pub fn local_address(&self) -> Ipv4Addr {
        self.inner.lock().tuple.local_ip
    }

    pub fn local_port(&self) -> u16 {
        self.inner.lock().tuple.local_port
    }

    pub fn peer_address(&self) -> Ipv4Addr {
        self.inner.lock().tuple.peer_ip
    }

    pub fn peer_port(&self) -> u16 {
        self.inner.lock().tuple.peer_port
    }

    /// Whether the protocol layer considers the connection torn down.
    pub fn is_protocol_disconnected(&self) -> bool {
        self.inner.lock().state.is_disconnected()
    }

    // ========================================================================
    // User Operations
    // ========================================================================

    /// Bind to a local address and port, resolving the owning adapter.
    pub fn bind(&self, local_ip: Ipv4Addr, local_port: u16) -> Result<(), SocketError> {
        let adapter = self
            .stack
            .adapters()
            .from_ipv4_address(local_ip)
            .ok_or(SocketError::AddressNotAvailable)?;

        let mut inner = self.inner.lock();
        inner.tuple.local_ip = local_ip;
        inner.tuple.local_port = local_port;
        inner.adapter = Some(Arc::downgrade(&adapter));
        Ok(())
    }

    /// Register under the current tuple and enter the Listen state.
    pub fn listen(&self) -> Result<(), SocketError> {
        let mut inner = self.inner.lock();
        self.stack
            .sockets()
            .insert_tuple(inner.tuple, self.weak_self.clone())?;
        inner.registered = true;
        inner.state = TcpState::Listen;
        Ok(())
    }

    /// Start the three-way handshake towards `peer_ip:peer_port`.
    ///
    /// Resolves a route if the socket has no adapter yet, allocates an
    /// ephemeral local port if none is bound, transmits the SYN, and enters
    /// SynSent. A blocking call then parks until the handshake completes;
    /// a non-blocking call returns `InProgress` immediately.
    pub fn connect(
        &self,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        should_block: ShouldBlock,
    ) -> Result<(), SocketError> {
        {
            let mut inner = self.inner.lock();
            inner.tuple.peer_ip = peer_ip;
            inner.tuple.peer_port = peer_port;

            if inner.adapter.as_ref().and_then(Weak::upgrade).is_none() {
                let adapter = self
                    .stack
                    .adapters()
                    .for_route_to(peer_ip)
                    .ok_or(SocketError::HostUnreachable)?;
                inner.tuple.local_ip = adapter.lock().ipv4_address();
                inner.adapter = Some(Arc::downgrade(&adapter));
            }

            if inner.tuple.local_port == 0 {
                let port = self.stack.sockets().allocate_ephemeral(
                    inner.tuple.local_ip,
                    peer_ip,
                    peer_port,
                    self.weak_self.clone(),
                )?;
                inner.tuple.local_port = port;
                inner.registered = true;
            } else if !inner.registered {
                self.stack
                    .sockets()
                    .insert_tuple(inner.tuple, self.weak_self.clone())?;
                inner.registered = true;
            }

            inner.sequence_number = 0;
            inner.ack_number = 0;

            self.transmit(&mut inner, TCP_FLAG_SYN, &[])?;
            inner.state = TcpState::SynSent;
        }

        if should_block == ShouldBlock::No {
            return Err(SocketError::InProgress);
        }

        loop {
            {
                let inner = self.inner.lock();
                if inner.connected {
                    return Ok(());
                }
                if inner.state == TcpState::Closed {
                    return Err(SocketError::ConnectionReset);
                }
            }
            match self.connect_wait.wait() {
                WaitOutcome::Woken => continue,
                WaitOutcome::Interrupted => return Err(SocketError::Interrupted),
                WaitOutcome::Closed => return Err(SocketError::ConnectionReset),
                // No scheduler integration; behave like a non-blocking call.
                WaitOutcome::TimedOut => return Err(SocketError::InProgress),
            }
        }
    }

    /// Transmit `data` as one PUSH|ACK segment. Returns the byte count.
    pub fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(SocketError::NotConnected);
        }
        self.transmit(&mut inner, TCP_FLAG_PSH | TCP_FLAG_ACK, data)?;
        Ok(data.len())
    }

    /// Deliver the payload of the next buffered segment into `buf`.
    ///
    /// `buf` must be at least as large as the payload; undersized buffers
    /// are a programming error and abort.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let packet = self.rx.pop().ok_or(SocketError::WouldBlock)?;
        let (_ip, ip_payload) =
            parse_ipv4(packet.buffer.as_slice()).map_err(|_| SocketError::WouldBlock)?;
        let tcp = parse_tcp_header(ip_payload).map_err(|_| SocketError::WouldBlock)?;
        let payload = &ip_payload[tcp.header_len()..];

        assert!(buf.len() >= payload.len());
        buf[..payload.len()].copy_from_slice(payload);
        Ok(payload.len())
    }

    /// Close the sending direction.
    ///
    /// From Established this transmits `FIN|ACK` and waits out the peer in
    /// FinWait1; from CloseWait it transmits the final `FIN|ACK` and enters
    /// LastAck. Any other state drops straight to Closed.
    pub fn close(&self) -> Result<(), SocketError> {
        let mut inner = self.inner.lock();
        match inner.state {
            TcpState::Established => {
                self.transmit(&mut inner, TCP_FLAG_FIN | TCP_FLAG_ACK, &[])?;
                inner.state = TcpState::FinWait1;
                inner.connected = false;
            }
            TcpState::CloseWait => {
                self.transmit(&mut inner, TCP_FLAG_FIN | TCP_FLAG_ACK, &[])?;
                inner.state = TcpState::LastAck;
            }
            _ => {
                inner.state = TcpState::Closed;
                inner.connected = false;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Transmission
    // ========================================================================

    /// Build and transmit one segment for this connection.
    ///
    /// The advertised window is fixed; the acknowledgment number is stamped
    /// only on segments carrying ACK. The sequence number advances by one
    /// for a pure SYN and by the payload size otherwise, so a bare ACK does
    /// not consume sequence space.
    fn transmit(&self, inner: &mut TcpInner, flags: u8, payload: &[u8]) -> Result<(), SocketError> {
        assert!(inner.tuple.local_port != 0);

        let adapter = inner
            .adapter
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(SocketError::NetworkDown)?;

        let segment = build_tcp_segment(
            inner.tuple.local_ip,
            inner.tuple.peer_ip,
            inner.tuple.local_port,
            inner.tuple.peer_port,
            inner.sequence_number,
            inner.ack_number,
            flags,
            TCP_ADVERTISED_WINDOW,
            payload,
        );

        if flags == TCP_FLAG_SYN {
            inner.sequence_number = inner.sequence_number.wrapping_add(1);
        } else {
            inner.sequence_number = inner.sequence_number.wrapping_add(payload.len() as u32);
        }

        log::trace!(
            "tcp: {} tx flags={:#04x} seq={} ack={} len={}",
            inner.tuple,
            flags,
            inner.sequence_number,
            inner.ack_number,
            payload.len()
        );

        adapter
            .lock()
            .send_ipv4(EthAddr::ZERO, inner.tuple.peer_ip, Ipv4Proto::Tcp, &segment);
        self.stack.stats().inc_tcp_tx();
        Ok(())
    }

    // ========================================================================
    // Segment State Machine
    // ========================================================================

    /// Process one inbound segment for this connection.
    ///
    /// `packet` is the full IPv4 packet; `payload_size` is the TCP payload
    /// length already computed by the dispatcher. Returns the reason when
    /// the segment is dropped instead of processed.
    pub(crate) fn segment_arrived(
        &self,
        packet: &KBuffer,
        source_ip: Ipv4Addr,
        source_port: u16,
        seq_num: u32,
        ack_num: u32,
        flags: u8,
        payload_size: usize,
    ) -> Option<DropReason> {
        let mut inner = self.inner.lock();

        // Segments that do not acknowledge exactly what we have sent are
        // dropped before they can touch the state machine.
        if ack_num != inner.sequence_number {
            log::debug!(
                "tcp: {} ack/seq mismatch: got {}, wanted {}",
                inner.tuple,
                ack_num,
                inner.sequence_number
            );
            return Some(DropReason::AckMismatch);
        }

        let ps = payload_size as u32;
        let old_state = inner.state;

        match (old_state, flags) {
            // Stray segments on dead connections are answered with RST.
            (TcpState::Closed, _) | (TcpState::TimeWait, _) => {
                self.reset_to_closed(&mut inner);
            }

            // Passive open stops here.
            (TcpState::Listen, f) if f == TCP_FLAG_SYN => {
                log::debug!("tcp: {} incoming connections not supported", inner.tuple);
            }
            (TcpState::Listen, _) => {
                log::debug!("tcp: {} unexpected flags in Listen state", inner.tuple);
            }

            // Simultaneous open: our SYN crossed the peer's.
            (TcpState::SynSent, f) if f == TCP_FLAG_SYN => {
                inner.ack_number = seq_num.wrapping_add(ps).wrapping_add(1);
                let _ = self.transmit(&mut inner, TCP_FLAG_ACK, &[]);
                inner.state = TcpState::SynReceived;
            }
            (TcpState::SynSent, f) if f == TCP_FLAG_SYN | TCP_FLAG_ACK => {
                inner.ack_number = seq_num.wrapping_add(ps).wrapping_add(1);
                let _ = self.transmit(&mut inner, TCP_FLAG_ACK, &[]);
                inner.state = TcpState::Established;
                inner.connected = true;
                self.connect_wait.wake_all();
            }

            (TcpState::SynReceived, f) if f == TCP_FLAG_ACK => {
                inner.ack_number = seq_num.wrapping_add(ps).wrapping_add(1);
                inner.state = TcpState::Established;
                inner.connected = true;
                self.connect_wait.wake_all();
            }

            (TcpState::LastAck, f) if f == TCP_FLAG_ACK => {
                inner.ack_number = seq_num.wrapping_add(ps).wrapping_add(1);
                inner.state = TcpState::Closed;
            }

            (TcpState::FinWait1, f) if f == TCP_FLAG_ACK => {
                inner.ack_number = seq_num.wrapping_add(ps).wrapping_add(1);
                inner.state = TcpState::FinWait2;
            }
            (TcpState::FinWait1, f) if f == TCP_FLAG_FIN => {
                inner.ack_number = seq_num.wrapping_add(ps).wrapping_add(1);
                inner.state = TcpState::Closing;
            }

            (TcpState::FinWait2, f) if f == TCP_FLAG_FIN => {
                inner.ack_number = seq_num.wrapping_add(ps).wrapping_add(1);
                inner.state = TcpState::TimeWait;
            }

            (TcpState::Closing, f) if f == TCP_FLAG_ACK => {
                inner.ack_number = seq_num.wrapping_add(ps).wrapping_add(1);
                inner.state = TcpState::TimeWait;
            }

            // The peer is closing; take any piggybacked data first, then
            // acknowledge the FIN octet.
            (TcpState::Established, f) if f & TCP_FLAG_FIN != 0 => {
                if payload_size != 0 {
                    self.did_receive(source_ip, source_port, packet.clone());
                }
                inner.ack_number = seq_num.wrapping_add(ps).wrapping_add(1);
                let _ = self.transmit(&mut inner, TCP_FLAG_ACK, &[]);
                inner.state = TcpState::CloseWait;
                inner.connected = false;
                self.connect_wait.wake_all();
            }

            // Data transfer: a byte-level acknowledgment, no flag octet.
            (TcpState::Established, _) => {
                inner.ack_number = seq_num.wrapping_add(ps);
                let _ = self.transmit(&mut inner, TCP_FLAG_ACK, &[]);
                if payload_size != 0 {
                    self.did_receive(source_ip, source_port, packet.clone());
                }
            }

            // Everything else resets the connection.
            _ => {
                log::debug!(
                    "tcp: {} unexpected flags {:#04x} in {:?} state",
                    inner.tuple,
                    flags,
                    old_state
                );
                self.reset_to_closed(&mut inner);
            }
        }

        if old_state != inner.state {
            log::debug!("tcp: {} {:?} -> {:?}", inner.tuple, old_state, inner.state);
        }
        None
    }

    /// Answer with RST and tear the connection down.
    fn reset_to_closed(&self, inner: &mut TcpInner) {
        let _ = self.transmit(inner, TCP_FLAG_RST, &[]);
        self.stack.stats().inc_tcp_rst_tx();
        inner.state = TcpState::Closed;
        inner.connected = false;
        self.connect_wait.wake_all();
    }

    /// Hand a shared copy of the packet to the receive queue.
    fn did_receive(&self, source_ip: Ipv4Addr, source_port: u16, buffer: KBuffer) {
        self.rx.push(ReceivedPacket {
            source_ip,
            source_port,
            buffer,
        });
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.registered {
            self.stack.sockets().unregister(inner.tuple);
        }
    }
}

// ============================================================================
// Socket Table
// ============================================================================

/// The registry tying inbound traffic to live sockets: TCP by four-tuple,
/// UDP by destination port, ICMP as a broadcast set.
///
/// Entries are weak; a lookup upgrades under the lock and prunes entries
/// whose socket is gone.
pub struct SocketTable {
    tcp_by_tuple: Mutex<BTreeMap<FourTuple, Weak<TcpSocket>>>,
    udp_by_port: Mutex<BTreeMap<u16, Weak<UdpSocket>>>,
    icmp_sockets: Mutex<alloc::vec::Vec<Weak<IcmpSocket>>>,
}

impl SocketTable {
    pub const fn new() -> Self {
        SocketTable {
            tcp_by_tuple: Mutex::new(BTreeMap::new()),
            udp_by_port: Mutex::new(BTreeMap::new()),
            icmp_sockets: Mutex::new(alloc::vec::Vec::new()),
        }
    }

    // ========================================================================
    // TCP Registry
    // ========================================================================

    /// Look up the socket registered under `tuple`.
    pub fn from_tuple(&self, tuple: &FourTuple) -> Option<Arc<TcpSocket>> {
        let mut map = self.tcp_by_tuple.lock();
        match map.get(tuple).map(Weak::upgrade) {
            Some(Some(socket)) => Some(socket),
            Some(None) => {
                map.remove(tuple);
                None
            }
            None => None,
        }
    }

    /// Look up by the four endpoint fields.
    pub fn from_endpoints(
        &self,
        local_ip: Ipv4Addr,
        local_port: u16,
        peer_ip: Ipv4Addr,
        peer_port: u16,
    ) -> Option<Arc<TcpSocket>> {
        self.from_tuple(&FourTuple::new(local_ip, local_port, peer_ip, peer_port))
    }

    /// Register `socket` under `tuple`, failing if the tuple is taken by a
    /// live socket.
    pub(crate) fn insert_tuple(
        &self,
        tuple: FourTuple,
        socket: Weak<TcpSocket>,
    ) -> Result<(), SocketError> {
        let mut map = self.tcp_by_tuple.lock();
        if let Some(existing) = map.get(&tuple) {
            if existing.strong_count() > 0 {
                return Err(SocketError::AddressInUse);
            }
        }
        map.insert(tuple, socket);
        Ok(())
    }

    /// Drop the registration for `tuple`.
    pub(crate) fn unregister(&self, tuple: FourTuple) {
        self.tcp_by_tuple.lock().remove(&tuple);
    }

    /// Visit every live registered TCP socket.
    pub fn for_each_tcp(&self, mut callback: impl FnMut(&Arc<TcpSocket>)) {
        let map = self.tcp_by_tuple.lock();
        for socket in map.values().filter_map(Weak::upgrade) {
            callback(&socket);
        }
    }

    /// Number of registered TCP tuples (live or not yet pruned).
    pub fn tcp_socket_count(&self) -> usize {
        self.tcp_by_tuple.lock().len()
    }

    /// Pick and register an ephemeral local port for a connection to
    /// `peer_ip:peer_port`.
    ///
    /// The starting port is drawn uniformly from the ephemeral range, then
    /// probed linearly (wrapping) until a free tuple is found. The scan and
    /// the insertion happen under one hold of the registry lock. When every
    /// port in the range is taken the allocation fails.
    pub(crate) fn allocate_ephemeral(
        &self,
        local_ip: Ipv4Addr,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        socket: Weak<TcpSocket>,
    ) -> Result<u16, SocketError> {
        const RANGE: u32 = (EPHEMERAL_PORT_LAST - EPHEMERAL_PORT_FIRST + 1) as u32;

        let first_scan_port = EPHEMERAL_PORT_FIRST + (random_u32() % RANGE) as u16;
        let mut map = self.tcp_by_tuple.lock();

        let mut port = first_scan_port;
        loop {
            let tuple = FourTuple::new(local_ip, port, peer_ip, peer_port);
            let taken = map
                .get(&tuple)
                .map(|w| w.strong_count() > 0)
                .unwrap_or(false);
            if !taken {
                map.insert(tuple, socket);
                return Ok(port);
            }

            port = if port == EPHEMERAL_PORT_LAST {
                EPHEMERAL_PORT_FIRST
            } else {
                port + 1
            };
            if port == first_scan_port {
                return Err(SocketError::AddressInUse);
            }
        }
    }

    // ========================================================================
    // UDP Port Registry
    // ========================================================================

    /// Look up the socket bound to `port`.
    pub fn udp_from_port(&self, port: u16) -> Option<Arc<UdpSocket>> {
        let mut map = self.udp_by_port.lock();
        match map.get(&port).map(Weak::upgrade) {
            Some(Some(socket)) => Some(socket),
            Some(None) => {
                map.remove(&port);
                None
            }
            None => None,
        }
    }

    pub(crate) fn bind_udp(&self, port: u16, socket: Weak<UdpSocket>) -> Result<(), SocketError> {
        let mut map = self.udp_by_port.lock();
        if let Some(existing) = map.get(&port) {
            if existing.strong_count() > 0 {
                return Err(SocketError::AddressInUse);
            }
        }
        map.insert(port, socket);
        Ok(())
    }

    pub(crate) fn unbind_udp(&self, port: u16) {
        self.udp_by_port.lock().remove(&port);
    }

    // ========================================================================
    // ICMP Socket Set
    // ========================================================================

    pub(crate) fn register_icmp(&self, socket: Weak<IcmpSocket>) {
        self.icmp_sockets.lock().push(socket);
    }

    /// Strong handles to every live ICMP socket; dead entries are pruned.
    pub(crate) fn icmp_receivers(&self) -> alloc::vec::Vec<Arc<IcmpSocket>> {
        let mut sockets = self.icmp_sockets.lock();
        sockets.retain(|w| w.strong_count() > 0);
        sockets.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sent_tcp_segments, test_stack_with_adapter};
    use crate::NetConfig;
    use crate::NetStack;

    const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

    #[test]
    fn test_wait_queue_pending_wake_is_consumed() {
        let queue = WaitQueue::new();
        queue.wake_one();
        assert_eq!(queue.wait(), WaitOutcome::Woken);
        // The pending wake is gone; without hooks we fall back to polling
        assert_eq!(queue.wait(), WaitOutcome::TimedOut);
    }

    #[test]
    fn test_wait_queue_close() {
        let queue = WaitQueue::new();
        queue.close();
        assert_eq!(queue.wait(), WaitOutcome::Closed);
    }

    #[test]
    fn test_registry_registration_is_unique() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);

        let first = TcpSocket::create(&stack);
        first.bind(LOCAL_IP, 8080).unwrap();
        first.listen().unwrap();
        assert_eq!(first.state(), TcpState::Listen);

        let tuple = first.tuple();
        let found = stack.sockets().from_tuple(&tuple).expect("registered");
        assert!(Arc::ptr_eq(&found, &first));

        // Second listener on the same tuple is refused
        let second = TcpSocket::create(&stack);
        second.bind(LOCAL_IP, 8080).unwrap();
        assert_eq!(second.listen().unwrap_err(), SocketError::AddressInUse);
    }

    #[test]
    fn test_registry_entry_removed_on_drop() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);

        let socket = TcpSocket::create(&stack);
        socket.bind(LOCAL_IP, 9000).unwrap();
        socket.listen().unwrap();
        let tuple = socket.tuple();

        assert!(stack.sockets().from_tuple(&tuple).is_some());
        drop(socket);
        assert!(stack.sockets().from_tuple(&tuple).is_none());
        assert_eq!(stack.sockets().tcp_socket_count(), 0);
    }

    #[test]
    fn test_bind_requires_owned_address() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);
        let socket = TcpSocket::create(&stack);
        assert_eq!(
            socket.bind(Ipv4Addr::new(172, 16, 0, 1), 80).unwrap_err(),
            SocketError::AddressNotAvailable
        );
    }

    #[test]
    fn test_connect_without_route_is_unreachable() {
        // A stack with no adapters at all has no route anywhere
        let stack = NetStack::new(NetConfig::default());
        let socket = TcpSocket::create(&stack);
        assert_eq!(
            socket
                .connect(PEER_IP, 80, ShouldBlock::No)
                .unwrap_err(),
            SocketError::HostUnreachable
        );
    }

    #[test]
    fn test_connect_emits_syn_and_registers() {
        let (stack, tx) = test_stack_with_adapter(LOCAL_IP);
        let socket = TcpSocket::create(&stack);

        let err = socket.connect(PEER_IP, 80, ShouldBlock::No).unwrap_err();
        assert_eq!(err, SocketError::InProgress);
        assert_eq!(socket.state(), TcpState::SynSent);

        // Local endpoint was filled in from the route
        assert_eq!(socket.local_address(), LOCAL_IP);
        let port = socket.local_port();
        assert!((EPHEMERAL_PORT_FIRST..=EPHEMERAL_PORT_LAST).contains(&port));

        // Registered under its tuple
        let tuple = socket.tuple();
        assert!(stack.sockets().from_tuple(&tuple).is_some());

        // A pure SYN went out, and consumed one sequence number
        let segments = sent_tcp_segments(&tx);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0.flags, TCP_FLAG_SYN);
        assert_eq!(segments[0].0.seq_num, 0);
        assert_eq!(segments[0].0.ack_num, 0);
        assert_eq!(socket.sequence_number(), 1);
    }

    #[test]
    fn test_send_requires_connection() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);
        let socket = TcpSocket::create(&stack);
        assert_eq!(socket.send(b"hi").unwrap_err(), SocketError::NotConnected);
    }

    #[test]
    fn test_receive_empty_queue_would_block() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);
        let socket = TcpSocket::create(&stack);
        let mut buf = [0u8; 16];
        assert_eq!(socket.receive(&mut buf).unwrap_err(), SocketError::WouldBlock);
    }

    #[test]
    fn test_ephemeral_ports_exhaust_exactly() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);
        let placeholder = TcpSocket::create(&stack);

        let mut seen = alloc::collections::BTreeSet::new();
        for _ in 0..28_232 {
            let port = stack
                .sockets()
                .allocate_ephemeral(LOCAL_IP, PEER_IP, 80, Arc::downgrade(&placeholder))
                .expect("range not yet exhausted");
            assert!((EPHEMERAL_PORT_FIRST..=EPHEMERAL_PORT_LAST).contains(&port));
            assert!(seen.insert(port), "port {} allocated twice", port);
        }
        assert_eq!(seen.len(), 28_232);

        assert_eq!(
            stack
                .sockets()
                .allocate_ephemeral(LOCAL_IP, PEER_IP, 80, Arc::downgrade(&placeholder))
                .unwrap_err(),
            SocketError::AddressInUse
        );
    }

    #[test]
    fn test_ephemeral_allocation_skips_taken_tuples() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);
        let holder = TcpSocket::create(&stack);

        // Occupy every tuple in the range except one; whatever starting
        // port the allocator draws, probing must land on the free port.
        const FREE_PORT: u16 = 40_000;
        for port in EPHEMERAL_PORT_FIRST..=EPHEMERAL_PORT_LAST {
            if port != FREE_PORT {
                stack
                    .sockets()
                    .insert_tuple(
                        FourTuple::new(LOCAL_IP, port, PEER_IP, 80),
                        Arc::downgrade(&holder),
                    )
                    .unwrap();
            }
        }

        let socket = TcpSocket::create(&stack);
        let port = stack
            .sockets()
            .allocate_ephemeral(LOCAL_IP, PEER_IP, 80, Arc::downgrade(&socket))
            .unwrap();
        assert_eq!(port, FREE_PORT);
    }

    #[test]
    fn test_udp_bind_and_port_registry() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);

        let socket = UdpSocket::create(&stack);
        socket.bind(5353).unwrap();
        assert_eq!(socket.local_port(), 5353);

        let found = stack.sockets().udp_from_port(5353).expect("bound");
        assert!(Arc::ptr_eq(&found, &socket));

        let clash = UdpSocket::create(&stack);
        assert_eq!(clash.bind(5353).unwrap_err(), SocketError::AddressInUse);

        drop(socket);
        assert!(stack.sockets().udp_from_port(5353).is_none());
    }

    #[test]
    fn test_icmp_receiver_set_prunes_dead_sockets() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);

        let alive = IcmpSocket::create(&stack);
        let doomed = IcmpSocket::create(&stack);
        assert_eq!(stack.sockets().icmp_receivers().len(), 2);

        drop(doomed);
        let receivers = stack.sockets().icmp_receivers();
        assert_eq!(receivers.len(), 1);
        assert!(Arc::ptr_eq(&receivers[0], &alive));
    }

    #[test]
    fn test_for_each_tcp_visits_live_sockets() {
        let (stack, _tx) = test_stack_with_adapter(LOCAL_IP);

        let a = TcpSocket::create(&stack);
        a.bind(LOCAL_IP, 1111).unwrap();
        a.listen().unwrap();
        let b = TcpSocket::create(&stack);
        b.bind(LOCAL_IP, 2222).unwrap();
        b.listen().unwrap();

        let mut visited = 0;
        stack.sockets().for_each_tcp(|_socket| visited += 1);
        assert_eq!(visited, 2);
    }
}
