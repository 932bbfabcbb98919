//! Availability checks for a single protocol
//!
//! One checker owns the candidate port list and probe strategy for one
//! protocol. Ports are probed concurrently; `check_availability` waits for
//! every probe and reports all responding ports, `get_first_to_respond`
//! races them and takes the first answer.

use super::probes;
use super::{ServerEndpoint, TransportProtocol, VpnProtocol, WireGuardTransport};
use crate::config::SmartProtocolConfig;
use log::{debug, warn};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Outcome of probing one protocol across its candidate ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityResult {
    Unavailable,
    /// Responding ports in arrival order; never empty.
    Available(Vec<u16>),
}

impl AvailabilityResult {
    pub fn is_available(&self) -> bool {
        matches!(self, AvailabilityResult::Available(_))
    }
}

#[derive(Debug, Clone)]
enum ProbeStrategy {
    WireGuardUdp,
    OpenVpn {
        transport: TransportProtocol,
        static_key: String,
    },
    Ikev2,
    /// Reported available on the candidate ports without probing.
    AlwaysAvailable,
}

/// Everything one probe task needs, resolved up front so spawned tasks own
/// their data.
#[derive(Debug)]
struct PreparedProbe {
    addr: SocketAddr,
    payload: Vec<u8>,
    tcp: bool,
    timeout: Duration,
}

impl PreparedProbe {
    async fn run(self) -> bool {
        if self.tcp {
            probes::tcp_probe(self.addr, &self.payload, self.timeout).await
        } else {
            probes::udp_probe(self.addr, &self.payload, self.timeout).await
        }
    }
}

/// Availability checker for one protocol. Cheap to clone; each check owns
/// its own sockets.
#[derive(Debug, Clone)]
pub struct AvailabilityChecker {
    protocol: VpnProtocol,
    default_ports: Vec<u16>,
    probe_timeout: Duration,
    strategy: ProbeStrategy,
}

impl AvailabilityChecker {
    pub fn for_protocol(protocol: VpnProtocol, config: &SmartProtocolConfig) -> Self {
        let (default_ports, strategy) = match protocol {
            VpnProtocol::WireGuard(WireGuardTransport::Udp) => (
                config.wireguard.default_udp_ports.clone(),
                ProbeStrategy::WireGuardUdp,
            ),
            // Stealth transports terminate at a local proxy, not at the
            // probed server; they are usable whenever they are enabled.
            VpnProtocol::WireGuard(WireGuardTransport::Tcp) => (
                config.wireguard.default_tcp_ports.clone(),
                ProbeStrategy::AlwaysAvailable,
            ),
            VpnProtocol::WireGuard(WireGuardTransport::Tls) => (
                config.wireguard.default_tls_ports.clone(),
                ProbeStrategy::AlwaysAvailable,
            ),
            VpnProtocol::OpenVpn(transport) => (
                match transport {
                    TransportProtocol::Udp => config.openvpn.default_udp_ports.clone(),
                    TransportProtocol::Tcp => config.openvpn.default_tcp_ports.clone(),
                },
                ProbeStrategy::OpenVpn {
                    transport,
                    static_key: config.openvpn.static_key.clone(),
                },
            ),
            VpnProtocol::Ikev2 => (config.ikev2_ports.clone(), ProbeStrategy::Ikev2),
        };

        Self {
            protocol,
            default_ports,
            probe_timeout: config.probe_timeout(),
            strategy,
        }
    }

    pub fn protocol(&self) -> VpnProtocol {
        self.protocol
    }

    /// Probe every candidate port and report the responding ones. Resolves
    /// once the slowest probe has answered or timed out.
    pub async fn check_availability(&self, server: &ServerEndpoint) -> AvailabilityResult {
        let mut ports = self.candidate_ports(server);
        if ports.is_empty() {
            return AvailabilityResult::Unavailable;
        }

        if matches!(self.strategy, ProbeStrategy::AlwaysAvailable) {
            debug!(
                "{} treated as available for {} on {:?}",
                self.protocol, server.domain, ports
            );
            return AvailabilityResult::Available(ports);
        }

        ports.shuffle(&mut rand::thread_rng());

        let Some(probes) = self.prepare_probes(server, &ports) else {
            return AvailabilityResult::Unavailable;
        };

        let responding = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::with_capacity(probes.len());
        for (port, probe) in probes {
            let responding = Arc::clone(&responding);
            handles.push(tokio::spawn(async move {
                if probe.run().await {
                    if let Ok(mut ports) = responding.lock() {
                        ports.push(port);
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let responding = responding
            .lock()
            .map(|ports| ports.clone())
            .unwrap_or_default();
        if responding.is_empty() {
            debug!("{} unavailable for {}", self.protocol, server.domain);
            AvailabilityResult::Unavailable
        } else {
            debug!(
                "{} available for {} on {:?}",
                self.protocol, server.domain, responding
            );
            AvailabilityResult::Available(responding)
        }
    }

    /// Race all candidate ports and return the first one that answers.
    /// Losing probes are left to run out their timeout on their own.
    pub async fn get_first_to_respond(&self, server: &ServerEndpoint) -> Option<u16> {
        let mut ports = self.candidate_ports(server);
        if ports.is_empty() {
            return None;
        }

        if matches!(self.strategy, ProbeStrategy::AlwaysAvailable) {
            return ports.first().copied();
        }

        ports.shuffle(&mut rand::thread_rng());

        let probes = self.prepare_probes(server, &ports)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        for (port, probe) in probes {
            let tx = tx.clone();
            tokio::spawn(async move {
                if probe.run().await {
                    let _ = tx.send(port);
                }
            });
        }
        drop(tx);

        rx.recv().await
    }

    /// Candidate ports for this server: its per-protocol overrides when
    /// present, this checker's defaults otherwise.
    fn candidate_ports(&self, server: &ServerEndpoint) -> Vec<u16> {
        server
            .port_overrides(self.protocol)
            .map(|ports| ports.to_vec())
            .unwrap_or_else(|| self.default_ports.clone())
    }

    /// All probes, or `None` when the server cannot be probed at all
    /// (missing entry IP, or missing server key for WireGuard).
    fn prepare_probes(
        &self,
        server: &ServerEndpoint,
        ports: &[u16],
    ) -> Option<Vec<(u16, PreparedProbe)>> {
        let mut prepared = Vec::with_capacity(ports.len());
        for &port in ports {
            match self.prepare_probe(server, port) {
                Some(probe) => prepared.push((port, probe)),
                None => {
                    warn!(
                        "{} cannot be probed for {}, reporting unavailable",
                        self.protocol, server.domain
                    );
                    return None;
                }
            }
        }
        Some(prepared)
    }

    fn prepare_probe(&self, server: &ServerEndpoint, port: u16) -> Option<PreparedProbe> {
        let ip = server.entry_ip(self.protocol)?;

        let (payload, tcp) = match &self.strategy {
            ProbeStrategy::WireGuardUdp => {
                // Without the server key there is nothing meaningful to send
                server.wireguard_public_key.as_ref()?;
                (probes::discovery_datagram(), false)
            }
            ProbeStrategy::OpenVpn {
                transport,
                static_key,
            } => {
                let tcp = *transport == TransportProtocol::Tcp;
                (probes::openvpn_probe_packet(static_key, tcp)?, tcp)
            }
            ProbeStrategy::Ikev2 => (probes::discovery_datagram(), false),
            ProbeStrategy::AlwaysAvailable => return None,
        };

        Some(PreparedProbe {
            addr: SocketAddr::new(ip, port),
            payload,
            tcp,
            timeout: self.probe_timeout,
        })
    }
}
