//! knet: the core of an in-kernel IPv4 network stack.
//!
//! This crate provides the packet demultiplexing loop and the TCP
//! connection machinery of a small kernel network stack:
//!
//! - Wire codecs for Ethernet II, ARP, IPv4, ICMP, UDP and TCP, with
//!   pseudo-header checksumming
//! - An ARP resolver answering for owned addresses and learning from
//!   replies
//! - A four-tuple socket registry with ephemeral port allocation
//! - The TCP connection state machine (active open, data transfer,
//!   teardown)
//! - An ICMP echo responder and a port-keyed UDP dispatcher
//! - The single dispatch task that drains all adapters
//!
//! # Structure
//!
//! Process-wide state lives in one [`NetStack`] value created by an
//! explicit startup step ([`init`]); the dispatcher, the ARP resolver and
//! the sockets all reach it through a narrow handle. Adapter drivers and
//! the scheduler are external: drivers implement [`NetAdapter`], the
//! scheduler registers [`NetWaitHooks`] for blocking waits and an
//! [`EntropySource`] for port randomization.
//!
//! # Example
//!
//! ```ignore
//! let stack = knet::init(NetConfig::default());
//! stack.register_device(MyNicDriver::probe()?);
//! // ... spawn a kernel task running:
//! knet::stack::run_dispatch_loop(stack);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use spin::Once;

pub mod arp;
pub mod buffer;
pub mod device;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod udp;

pub use arp::{
    build_arp_reply, build_arp_request, parse_arp, process_arp, serialize_arp, ArpError, ArpOp,
    ArpPacket, ArpResult, ArpStats, ArpTable,
};
pub use buffer::KBuffer;
pub use device::{AdapterHandle, AdapterRef, AdapterRegistry, LoopbackAdapter, NetAdapter};
pub use ethernet::{
    build_ethernet_frame, parse_ethernet, EthAddr, EthError, EthHeader, ETHERTYPE_ARP,
    ETHERTYPE_IPV4, ETH_HEADER_LEN,
};
pub use icmp::{
    build_echo_reply, build_echo_request, parse_icmp, parse_icmp_echo, IcmpError, IcmpHeader,
    ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST,
};
pub use ipv4::{
    build_ipv4_header, internet_checksum, parse_ipv4, Ipv4Addr, Ipv4Error, Ipv4Header, Ipv4Proto,
};
pub use socket::{
    register_entropy_source, register_net_wait_hooks, EntropySource, FourTuple, IcmpSocket,
    NetWaitHooks, ShouldBlock, SocketError, SocketTable, TcpSocket, UdpSocket, WaitOutcome,
    WaitQueue, EPHEMERAL_PORT_FIRST, EPHEMERAL_PORT_LAST,
};
pub use stack::{
    poll_once, process_frame, run_dispatch_loop, DropReason, NetConfig, NetStats, ProcessResult,
};
pub use tcp::{
    build_tcp_segment, compute_tcp_checksum, parse_tcp_header, verify_tcp_checksum, TcpError,
    TcpHeader, TcpState, TCP_ADVERTISED_WINDOW, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH,
    TCP_FLAG_RST, TCP_FLAG_SYN, TCP_FLAG_URG,
};
pub use udp::{build_udp_datagram, compute_udp_checksum, parse_udp, UdpError, UdpHeader};

// ============================================================================
// The Network Subsystem
// ============================================================================

/// The network subsystem: adapters, the ARP table, the socket registry,
/// statistics, and the dispatch task's wait condition.
///
/// One instance is created per system by [`init`]; everything in the stack
/// reaches shared state through a handle to it rather than through
/// free-standing globals.
pub struct NetStack {
    config: stack::NetConfig,
    adapters: device::AdapterRegistry,
    arp: arp::ArpTable,
    sockets: socket::SocketTable,
    stats: stack::NetStats,
    dispatch_wait: socket::WaitQueue,
}

impl NetStack {
    /// Create a stack with no adapters registered.
    pub fn new(config: stack::NetConfig) -> Arc<NetStack> {
        Arc::new(NetStack {
            config,
            adapters: device::AdapterRegistry::new(),
            arp: arp::ArpTable::new(),
            sockets: socket::SocketTable::new(),
            stats: stack::NetStats::new(),
            dispatch_wait: socket::WaitQueue::new(),
        })
    }

    /// The adapter registry.
    pub fn adapters(&self) -> &device::AdapterRegistry {
        &self.adapters
    }

    /// The ARP resolution table.
    pub fn arp_table(&self) -> &arp::ArpTable {
        &self.arp
    }

    /// The socket registry.
    pub fn sockets(&self) -> &socket::SocketTable {
        &self.sockets
    }

    /// Dispatcher statistics.
    pub fn stats(&self) -> &stack::NetStats {
        &self.stats
    }

    /// The dispatch task's wait condition. Adapter drivers wake it when
    /// frames arrive.
    pub fn dispatch_wait(&self) -> &socket::WaitQueue {
        &self.dispatch_wait
    }

    /// The startup configuration.
    pub fn config(&self) -> &stack::NetConfig {
        &self.config
    }

    /// Register an adapter.
    ///
    /// The first hardware adapter that arrives without an address is
    /// assigned the configured NIC address.
    pub fn register_adapter(&self, adapter: device::AdapterHandle) {
        {
            let mut guard = adapter.lock();
            if !guard.is_loopback()
                && guard.ipv4_address().is_unspecified()
                && self.adapters.from_ipv4_address(self.config.address).is_none()
            {
                guard.set_ipv4_address(self.config.address);
                log::info!("net: {} assigned address {}", guard.name(), self.config.address);
            }
        }
        self.adapters.register(adapter);
    }

    /// Box and register a concrete adapter, returning its handle.
    pub fn register_device<A: device::NetAdapter + 'static>(
        &self,
        adapter: A,
    ) -> device::AdapterHandle {
        let handle: device::AdapterHandle =
            Arc::new(spin::Mutex::new(alloc::boxed::Box::new(adapter)));
        self.register_adapter(handle.clone());
        handle
    }
}

static NET_STACK: Once<Arc<NetStack>> = Once::new();

/// Start the network subsystem: create the stack and register the loopback
/// adapter. Later calls return the existing instance.
pub fn init(config: stack::NetConfig) -> &'static Arc<NetStack> {
    NET_STACK.call_once(|| {
        let stack = NetStack::new(config);
        stack.register_device(device::LoopbackAdapter::new());
        log::info!("net: subsystem initialized");
        stack
    })
}

/// The running stack, if [`init`] has been called.
pub fn net_stack() -> Option<&'static Arc<NetStack>> {
    NET_STACK.get()
}

// ============================================================================
// Test Utilities
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestAdapter;

    #[test]
    fn test_unaddressed_nic_gets_configured_address() {
        let stack = NetStack::new(stack::NetConfig::default());
        let (adapter, _tx) = TestAdapter::create(ipv4::Ipv4Addr::UNSPECIFIED);
        stack.register_adapter(adapter);

        let found = stack
            .adapters()
            .from_ipv4_address(stack::DEFAULT_NIC_ADDRESS)
            .expect("NIC picked up the configured address");
        assert_eq!(found.lock().name(), "eth0");
    }

    #[test]
    fn test_preconfigured_adapter_keeps_its_address() {
        let stack = NetStack::new(stack::NetConfig::default());
        let (adapter, _tx) = TestAdapter::create(ipv4::Ipv4Addr::new(10, 0, 0, 2));
        stack.register_adapter(adapter);

        assert!(stack
            .adapters()
            .from_ipv4_address(stack::DEFAULT_NIC_ADDRESS)
            .is_none());
        assert!(stack
            .adapters()
            .from_ipv4_address(ipv4::Ipv4Addr::new(10, 0, 0, 2))
            .is_some());
    }

    #[test]
    fn test_init_registers_loopback_once() {
        let stack = init(stack::NetConfig::default());
        assert!(stack
            .adapters()
            .from_ipv4_address(ipv4::Ipv4Addr::LOCALHOST)
            .is_some());

        let again = init(stack::NetConfig::default());
        assert!(Arc::ptr_eq(stack, again));
        assert!(net_stack().is_some());
    }
}
