//! Connection feature set negotiated with the VPN backend
//!
//! The same feature record rides in two places: the body of a certificate
//! request (the backend signs the certificate for these features) and the
//! feature updates exchanged with the local agent over the tunnel. Wire keys
//! follow the agent protocol naming.

use serde::{Deserialize, Serialize};

/// NetShield filtering level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum NetShieldLevel {
    #[default]
    Off,
    /// Block malware.
    Level1,
    /// Block malware, ads and trackers.
    Level2,
}

impl From<NetShieldLevel> for u8 {
    fn from(level: NetShieldLevel) -> u8 {
        match level {
            NetShieldLevel::Off => 0,
            NetShieldLevel::Level1 => 1,
            NetShieldLevel::Level2 => 2,
        }
    }
}

impl TryFrom<u8> for NetShieldLevel {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(NetShieldLevel::Off),
            1 => Ok(NetShieldLevel::Level1),
            2 => Ok(NetShieldLevel::Level2),
            other => Err(format!("invalid netshield level {}", other)),
        }
    }
}

/// NAT mode requested from the server. Moderate maps to randomized
/// port mapping on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    #[default]
    Strict,
    Moderate,
}

impl NatType {
    pub fn randomized(self) -> bool {
        matches!(self, NatType::Moderate)
    }

    pub fn from_randomized(randomized: bool) -> Self {
        if randomized {
            NatType::Moderate
        } else {
            NatType::Strict
        }
    }
}

/// Feature set for one VPN connection.
///
/// `bouncing` carries the server IP label when the logical server multiplexes
/// several exits behind one entry address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectionFeatures {
    #[serde(rename = "netshield-level", default)]
    pub netshield: NetShieldLevel,

    /// VPN accelerator; the wire calls this split-tcp.
    #[serde(rename = "split-tcp", default)]
    pub vpn_accelerator: bool,

    #[serde(rename = "bouncing", default, skip_serializing_if = "Option::is_none")]
    pub bouncing: Option<String>,

    #[serde(
        rename = "randomized-nat",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    randomized_nat: Option<bool>,

    #[serde(rename = "safe-mode", default, skip_serializing_if = "Option::is_none")]
    pub safe_mode: Option<bool>,

    /// Only ever sent by the client to clear a jailed state; the agent never
    /// includes it in feature confirmations.
    #[serde(rename = "jail", default, skip_serializing_if = "Option::is_none")]
    pub jailed: Option<bool>,
}

impl ConnectionFeatures {
    pub fn nat_type(&self) -> NatType {
        NatType::from_randomized(self.randomized_nat.unwrap_or(false))
    }

    pub fn set_nat_type(&mut self, nat: NatType) {
        self.randomized_nat = Some(nat.randomized());
    }

    pub fn with_nat_type(mut self, nat: NatType) -> Self {
        self.set_nat_type(nat);
        self
    }

    /// Feature record that asks the agent to lift a soft jail.
    pub fn unjail(mut self) -> Self {
        self.jailed = Some(false);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netshield_level_roundtrip() {
        for level in [
            NetShieldLevel::Off,
            NetShieldLevel::Level1,
            NetShieldLevel::Level2,
        ] {
            let raw: u8 = level.into();
            assert_eq!(NetShieldLevel::try_from(raw).unwrap(), level);
        }
        assert!(NetShieldLevel::try_from(3).is_err());
    }

    #[test]
    fn test_features_wire_keys() {
        let features = ConnectionFeatures {
            netshield: NetShieldLevel::Level2,
            vpn_accelerator: true,
            bouncing: Some("2".to_string()),
            safe_mode: Some(true),
            ..Default::default()
        }
        .with_nat_type(NatType::Moderate);

        let json = serde_json::to_value(&features).unwrap();
        assert_eq!(json["netshield-level"], 2);
        assert_eq!(json["split-tcp"], true);
        assert_eq!(json["bouncing"], "2");
        assert_eq!(json["randomized-nat"], true);
        assert_eq!(json["safe-mode"], true);
        assert!(json.get("jail").is_none());
    }

    #[test]
    fn test_features_optional_fields_absent() {
        let json = serde_json::to_value(ConnectionFeatures::default()).unwrap();
        assert!(json.get("bouncing").is_none());
        assert!(json.get("randomized-nat").is_none());
        assert!(json.get("safe-mode").is_none());

        // Absent optionals deserialize back to defaults
        let parsed: ConnectionFeatures =
            serde_json::from_str(r#"{"netshield-level": 1, "split-tcp": false}"#).unwrap();
        assert_eq!(parsed.netshield, NetShieldLevel::Level1);
        assert_eq!(parsed.nat_type(), NatType::Strict);
        assert!(parsed.safe_mode.is_none());
    }

    #[test]
    fn test_unjail_sets_jail_key() {
        let features = ConnectionFeatures::default().unjail();
        let json = serde_json::to_value(&features).unwrap();
        assert_eq!(json["jail"], false);
    }

    #[test]
    fn test_nat_type_mapping() {
        assert!(!NatType::Strict.randomized());
        assert!(NatType::Moderate.randomized());
        assert_eq!(NatType::from_randomized(true), NatType::Moderate);
        assert_eq!(NatType::from_randomized(false), NatType::Strict);
    }
}
