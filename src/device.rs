//! Network adapter abstraction and registry.
//!
//! Drivers implement [`NetAdapter`] and register with the stack's
//! [`AdapterRegistry`]. The dispatcher drains adapters through the
//! registry (loopback traffic first); sockets transmit through a weak
//! adapter handle resolved at bind/connect time.
//!
//! # Buffer ownership
//!
//! Outbound bytes handed to `send_ethernet`/`send_ipv4` are owned by the
//! caller until the call returns; adapters copy what they need. Inbound
//! frames come out of `dequeue_packet` as owned buffers.
//!
//! # ARP on the transmit path
//!
//! `send_ipv4` with a zero destination MAC means "resolve the next hop
//! yourself" - a hardware driver consults the stack's ARP table. The
//! loopback adapter has no neighbors and ignores MACs entirely. When the
//! caller already knows the destination (answering an ARP request, echoing
//! a ping back to the frame source) it passes the MAC explicitly.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use crate::ethernet::{build_ethernet_frame, EthAddr, ETHERTYPE_IPV4};
use crate::ipv4::{build_ipv4_header, Ipv4Addr, Ipv4Proto, DEFAULT_TTL};

/// Shared handle to a registered adapter.
pub type AdapterHandle = Arc<Mutex<Box<dyn NetAdapter>>>;

/// Non-owning adapter reference, as held by sockets.
pub type AdapterRef = Weak<Mutex<Box<dyn NetAdapter>>>;

/// Maximum frames queued on the loopback adapter before drops.
const LOOPBACK_QUEUE_LIMIT: usize = 256;

// ============================================================================
// NetAdapter Trait
// ============================================================================

/// Core trait for network adapters (loopback and hardware NICs).
pub trait NetAdapter: Send {
    /// Adapter name (e.g. "lo", "eth0").
    fn name(&self) -> &str;

    /// The adapter's MAC address.
    fn mac_address(&self) -> EthAddr;

    /// The adapter's configured IPv4 address.
    fn ipv4_address(&self) -> Ipv4Addr;

    /// Configure the adapter's IPv4 address.
    fn set_ipv4_address(&mut self, address: Ipv4Addr);

    /// Whether this is the loopback adapter.
    fn is_loopback(&self) -> bool {
        false
    }

    /// Check for received frames without dequeuing.
    fn has_queued_packets(&self) -> bool;

    /// Take one received frame, if any.
    fn dequeue_packet(&mut self) -> Option<Vec<u8>>;

    /// Transmit a link-layer payload to `dst` with the given EtherType.
    fn send_ethernet(&mut self, dst: EthAddr, ethertype: u16, payload: &[u8]);

    /// Wrap `payload` in an IPv4 header sourced from this adapter and
    /// transmit it. A zero `dst_mac` asks the driver to resolve the
    /// destination through the ARP table.
    fn send_ipv4(&mut self, dst_mac: EthAddr, dst_ip: Ipv4Addr, proto: Ipv4Proto, payload: &[u8]) {
        let header = build_ipv4_header(
            self.ipv4_address(),
            dst_ip,
            proto,
            payload.len() as u16,
            DEFAULT_TTL,
        );
        let mut packet = Vec::with_capacity(header.len() + payload.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(payload);
        self.send_ethernet(dst_mac, ETHERTYPE_IPV4, &packet);
    }
}

// ============================================================================
// Adapter Registry
// ============================================================================

/// The set of registered adapters.
///
/// Registration order is preserved; the dispatcher polls loopback adapters
/// ahead of hardware ones.
pub struct AdapterRegistry {
    adapters: RwLock<Vec<AdapterHandle>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        AdapterRegistry {
            adapters: RwLock::new(Vec::new()),
        }
    }

    /// Register an adapter handle.
    pub fn register(&self, adapter: AdapterHandle) {
        self.adapters.write().push(adapter);
    }

    /// Box and register a concrete adapter, returning its handle.
    pub fn register_device<A: NetAdapter + 'static>(&self, adapter: A) -> AdapterHandle {
        let handle: AdapterHandle = Arc::new(Mutex::new(Box::new(adapter)));
        self.register(handle.clone());
        handle
    }

    /// Number of registered adapters.
    pub fn count(&self) -> usize {
        self.adapters.read().len()
    }

    /// The adapter owning `ip`, if any.
    pub fn from_ipv4_address(&self, ip: Ipv4Addr) -> Option<AdapterHandle> {
        let adapters = self.adapters.read();
        adapters
            .iter()
            .find(|a| a.lock().ipv4_address() == ip)
            .cloned()
    }

    /// Pick the adapter a packet to `dst` should leave through.
    ///
    /// Loopback destinations route to the loopback adapter; anything else
    /// goes to the first hardware adapter with a configured address.
    pub fn for_route_to(&self, dst: Ipv4Addr) -> Option<AdapterHandle> {
        let adapters = self.adapters.read();
        if dst.is_loopback() {
            return adapters.iter().find(|a| a.lock().is_loopback()).cloned();
        }
        adapters
            .iter()
            .find(|a| {
                let adapter = a.lock();
                !adapter.is_loopback() && !adapter.ipv4_address().is_unspecified()
            })
            .cloned()
    }

    /// Whether any adapter has a frame waiting. This is the dispatcher's
    /// park predicate.
    pub fn has_queued_packets(&self) -> bool {
        let adapters = self.adapters.read();
        adapters.iter().any(|a| a.lock().has_queued_packets())
    }

    /// Dequeue the next frame, draining loopback adapters first.
    pub fn dequeue_packet(&self) -> Option<Vec<u8>> {
        let adapters = self.adapters.read();
        for adapter in adapters.iter().filter(|a| a.lock().is_loopback()) {
            if let Some(frame) = adapter.lock().dequeue_packet() {
                log::trace!("net: received loopback packet ({} bytes)", frame.len());
                return Some(frame);
            }
        }
        for adapter in adapters.iter().filter(|a| !a.lock().is_loopback()) {
            let mut adapter = adapter.lock();
            if adapter.has_queued_packets() {
                return adapter.dequeue_packet();
            }
        }
        None
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Loopback Adapter
// ============================================================================

/// The loopback adapter: everything sent is requeued for local receive.
pub struct LoopbackAdapter {
    queue: VecDeque<Vec<u8>>,
    address: Ipv4Addr,
}

impl LoopbackAdapter {
    /// Locally administered MAC for loopback frames.
    const MAC: EthAddr = EthAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);

    /// Create the adapter, addressed 127.0.0.1.
    pub fn new() -> Self {
        LoopbackAdapter {
            queue: VecDeque::new(),
            address: Ipv4Addr::LOCALHOST,
        }
    }
}

impl Default for LoopbackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl NetAdapter for LoopbackAdapter {
    fn name(&self) -> &str {
        "lo"
    }

    fn mac_address(&self) -> EthAddr {
        Self::MAC
    }

    fn ipv4_address(&self) -> Ipv4Addr {
        self.address
    }

    fn set_ipv4_address(&mut self, address: Ipv4Addr) {
        self.address = address;
    }

    fn is_loopback(&self) -> bool {
        true
    }

    fn has_queued_packets(&self) -> bool {
        !self.queue.is_empty()
    }

    fn dequeue_packet(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    fn send_ethernet(&mut self, _dst: EthAddr, ethertype: u16, payload: &[u8]) {
        if self.queue.len() >= LOOPBACK_QUEUE_LIMIT {
            log::warn!("lo: receive queue full, dropping frame");
            return;
        }
        let frame = build_ethernet_frame(Self::MAC, Self::MAC, ethertype, payload);
        self.queue.push_back(frame);
    }
}

// ============================================================================
// Tests
// ============================================================================
