//! Smart protocol negotiation
//!
//! Before connecting, the client probes which VPN protocols the chosen server
//! actually answers on (UDP or TCP reachability differs per network) and
//! picks the best one by a fixed preference order. Firewalled networks that
//! drop everything except 443/TCP still get a working tunnel this way.
//!
//! - probes.rs: handshake/discovery packet construction and socket probes
//! - checker.rs: per-protocol availability checks with port fan-out
//! - resolver.rs: protocol to checker map for one connection attempt
//! - negotiator.rs: concurrent checks and priority selection

pub mod checker;
pub mod negotiator;
mod probes;
pub mod resolver;

pub use checker::{AvailabilityChecker, AvailabilityResult};
pub use negotiator::{NegotiatedProtocol, SmartProtocolNegotiator};
pub use resolver::CheckerResolver;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Transport under OpenVPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// Transport under WireGuard. Tcp and Tls are the stealth wrappings served
/// on TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireGuardTransport {
    Udp,
    Tcp,
    Tls,
}

/// A concrete protocol+transport combination the negotiator can pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VpnProtocol {
    WireGuard(WireGuardTransport),
    OpenVpn(TransportProtocol),
    Ikev2,
}

impl VpnProtocol {
    /// Every protocol, most preferred first.
    pub const ALL: [VpnProtocol; 6] = [
        VpnProtocol::WireGuard(WireGuardTransport::Udp),
        VpnProtocol::WireGuard(WireGuardTransport::Tcp),
        VpnProtocol::WireGuard(WireGuardTransport::Tls),
        VpnProtocol::OpenVpn(TransportProtocol::Udp),
        VpnProtocol::OpenVpn(TransportProtocol::Tcp),
        VpnProtocol::Ikev2,
    ];

    /// Selection rank, lower is preferred.
    pub fn priority(self) -> u8 {
        match self {
            VpnProtocol::WireGuard(WireGuardTransport::Udp) => 0,
            VpnProtocol::WireGuard(WireGuardTransport::Tcp) => 1,
            VpnProtocol::WireGuard(WireGuardTransport::Tls) => 2,
            VpnProtocol::OpenVpn(TransportProtocol::Udp) => 3,
            VpnProtocol::OpenVpn(TransportProtocol::Tcp) => 4,
            VpnProtocol::Ikev2 => 5,
        }
    }
}

impl fmt::Display for VpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnProtocol::WireGuard(WireGuardTransport::Udp) => write!(f, "WireGuard (UDP)"),
            VpnProtocol::WireGuard(WireGuardTransport::Tcp) => write!(f, "WireGuard (TCP)"),
            VpnProtocol::WireGuard(WireGuardTransport::Tls) => write!(f, "WireGuard (TLS)"),
            VpnProtocol::OpenVpn(TransportProtocol::Udp) => write!(f, "OpenVPN (UDP)"),
            VpnProtocol::OpenVpn(TransportProtocol::Tcp) => write!(f, "OpenVPN (TCP)"),
            VpnProtocol::Ikev2 => write!(f, "IKEv2"),
        }
    }
}

/// Per-protocol overrides a server may carry; a protocol absent from the map
/// uses the endpoint defaults.
#[derive(Debug, Clone, Default)]
pub struct ProtocolEntry {
    pub entry_ip: Option<IpAddr>,
    pub ports: Option<Vec<u16>>,
}

/// One server address as handed to the negotiator. Assembled from the server
/// list by the caller; this crate only reads it.
#[derive(Debug, Clone)]
pub struct ServerEndpoint {
    pub domain: String,
    pub entry_ip: Option<IpAddr>,
    pub protocol_entries: HashMap<VpnProtocol, ProtocolEntry>,
    /// X25519 public key of the server, required for WireGuard probes.
    pub wireguard_public_key: Option<String>,
    /// Label distinguishing exits multiplexed behind one entry address.
    pub label: Option<String>,
}

impl ServerEndpoint {
    pub fn new(domain: impl Into<String>, entry_ip: Option<IpAddr>) -> Self {
        Self {
            domain: domain.into(),
            entry_ip,
            protocol_entries: HashMap::new(),
            wireguard_public_key: None,
            label: None,
        }
    }

    /// Entry IP to probe for a protocol: the per-protocol override when
    /// present, the endpoint default otherwise.
    pub fn entry_ip(&self, protocol: VpnProtocol) -> Option<IpAddr> {
        self.protocol_entries
            .get(&protocol)
            .and_then(|entry| entry.entry_ip)
            .or(self.entry_ip)
    }

    /// Ports overriding the defaults for a protocol, when the server carries
    /// any.
    pub fn port_overrides(&self, protocol: VpnProtocol) -> Option<&[u16]> {
        self.protocol_entries
            .get(&protocol)
            .and_then(|entry| entry.ports.as_deref())
    }
}

/// Negotiation errors
#[derive(Debug, thiserror::Error)]
pub enum SmartProtocolError {
    #[error("None of the enabled protocols is available for {server}")]
    AllUnavailable { server: String },

    #[error("No protocols enabled for negotiation")]
    NoProtocolsEnabled,
}

pub type SmartProtocolResult<T> = Result<T, SmartProtocolError>;
