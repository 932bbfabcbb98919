//! Concurrent protocol negotiation

use super::checker::AvailabilityResult;
use super::resolver::CheckerResolver;
use super::{ServerEndpoint, SmartProtocolError, SmartProtocolResult, VpnProtocol};
use crate::config::SmartProtocolConfig;
use log::{debug, info};

/// Protocol and port picked by one negotiation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedProtocol {
    pub protocol: VpnProtocol,
    pub port: u16,
    /// Every port the winning protocol answered on.
    pub all_ports: Vec<u16>,
}

/// Runs the availability checks for the enabled protocols concurrently and
/// picks the best available one by static priority. When nothing is
/// available the caller gets an error, never a blind guess.
pub struct SmartProtocolNegotiator {
    resolver: CheckerResolver,
}

impl SmartProtocolNegotiator {
    pub fn new(config: &SmartProtocolConfig) -> Self {
        Self {
            resolver: CheckerResolver::new(config),
        }
    }

    pub async fn negotiate(
        &self,
        server: &ServerEndpoint,
        enabled: &[VpnProtocol],
    ) -> SmartProtocolResult<NegotiatedProtocol> {
        if enabled.is_empty() {
            return Err(SmartProtocolError::NoProtocolsEnabled);
        }

        debug!(
            "Negotiating protocol for {} among {} candidates",
            server.domain,
            enabled.len()
        );

        let mut handles = Vec::with_capacity(enabled.len());
        for &protocol in enabled {
            let Some(checker) = self.resolver.checker(protocol) else {
                continue;
            };
            let checker = checker.clone();
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                let result = checker.check_availability(&server).await;
                (protocol, result)
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(outcome) = handle.await {
                outcomes.push(outcome);
            }
        }

        for (protocol, result) in &outcomes {
            debug!("Availability of {}: {:?}", protocol, result);
        }

        outcomes.sort_by_key(|(protocol, _)| protocol.priority());

        for (protocol, result) in outcomes {
            if let AvailabilityResult::Available(ports) = result {
                if let Some(&port) = ports.first() {
                    info!(
                        "Negotiated {} on port {} for {}",
                        protocol, port, server.domain
                    );
                    return Ok(NegotiatedProtocol {
                        protocol,
                        port,
                        all_ports: ports,
                    });
                }
            }
        }

        Err(SmartProtocolError::AllUnavailable {
            server: server.domain.clone(),
        })
    }
}
