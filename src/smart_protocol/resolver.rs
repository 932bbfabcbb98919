//! Protocol to checker resolution

use super::checker::AvailabilityChecker;
use super::VpnProtocol;
use crate::config::SmartProtocolConfig;
use std::collections::HashMap;

/// Checkers for every protocol, built once per connection attempt from the
/// configuration current at that moment.
pub struct CheckerResolver {
    checkers: HashMap<VpnProtocol, AvailabilityChecker>,
}

impl CheckerResolver {
    pub fn new(config: &SmartProtocolConfig) -> Self {
        let checkers = VpnProtocol::ALL
            .iter()
            .map(|&protocol| (protocol, AvailabilityChecker::for_protocol(protocol, config)))
            .collect();

        Self { checkers }
    }

    /// Checker for a protocol. Covers all of `VpnProtocol::ALL`.
    pub fn checker(&self, protocol: VpnProtocol) -> Option<&AvailabilityChecker> {
        self.checkers.get(&protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_covers_every_protocol() {
        let resolver = CheckerResolver::new(&SmartProtocolConfig::default());
        for protocol in VpnProtocol::ALL {
            let checker = resolver.checker(protocol).unwrap();
            assert_eq!(checker.protocol(), protocol);
        }
    }
}
