//! Smart Protocol configuration
//!
//! Port tables and probe parameters for availability checking. The defaults
//! ship with the client and are normally overridden by the remote client
//! config; a cached copy persists to disk so a cold start negotiates with the
//! last known tables.

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE: &str = "smart_protocol.json";
const APP_NAME: &str = "KestrelVPN";

/// Per-probe timeout. Applies per port, not per batch; all ports of one
/// checker are probed in parallel.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;

/// OpenVPN probing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenVpnConfig {
    /// Candidate UDP ports, in no particular order; checkers shuffle.
    #[serde(default = "default_openvpn_udp_ports")]
    pub default_udp_ports: Vec<u16>,
    #[serde(default = "default_openvpn_tcp_ports")]
    pub default_tcp_ports: Vec<u16>,
    /// Hex-encoded tls-auth static key; the probe handshake is HMAC-signed
    /// with its tail 64 bytes so the server answers the reset instead of
    /// dropping it.
    #[serde(default = "default_openvpn_static_key")]
    pub static_key: String,
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            default_udp_ports: default_openvpn_udp_ports(),
            default_tcp_ports: default_openvpn_tcp_ports(),
            static_key: default_openvpn_static_key(),
        }
    }
}

/// WireGuard probing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardConfig {
    #[serde(default = "default_wireguard_udp_ports")]
    pub default_udp_ports: Vec<u16>,
    #[serde(default = "default_wireguard_tcp_ports")]
    pub default_tcp_ports: Vec<u16>,
    #[serde(default = "default_wireguard_tls_ports")]
    pub default_tls_ports: Vec<u16>,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            default_udp_ports: default_wireguard_udp_ports(),
            default_tcp_ports: default_wireguard_tcp_ports(),
            default_tls_ports: default_wireguard_tls_ports(),
        }
    }
}

/// Configuration for one negotiation attempt. Built once per attempt and
/// treated as immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartProtocolConfig {
    #[serde(default)]
    pub openvpn: OpenVpnConfig,
    #[serde(default)]
    pub wireguard: WireGuardConfig,
    #[serde(default = "default_ikev2_ports")]
    pub ikev2_ports: Vec<u16>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for SmartProtocolConfig {
    fn default() -> Self {
        Self {
            openvpn: OpenVpnConfig::default(),
            wireguard: WireGuardConfig::default(),
            ikev2_ports: default_ikev2_ports(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl SmartProtocolConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_openvpn_udp_ports() -> Vec<u16> {
    vec![80, 443, 4569, 1194, 5060]
}

fn default_openvpn_tcp_ports() -> Vec<u16> {
    vec![443, 5995, 8443]
}

fn default_openvpn_static_key() -> String {
    // tls-auth key shipped with the client profile; only the tail 64 bytes
    // feed the probe HMAC.
    concat!(
        "6acef03f62675b4b1bbd03e53b187727",
        "423cea742242106cb2916a8a4c829756",
        "3d22c7e5cef430b1103c6f66eb1fc5b3",
        "75a672f158e2e2e936c3faa48b035a6d",
        "e17beaac23b5f03b10b868d53d03521d",
        "8ba115059da777a60cbfd7b2c9c57472",
        "78a15b8f6e68a3ef7fd583ec9f398c8b",
        "d4735dab40cbd1e3c62a822e97489186",
        "c30a0b48c7c38ea32ceb056d3fa5a710",
        "e10ed6e9c543fc0025293e6b8743cfe8",
        "346355d4c6ae1e57b642d7be0eb548ba",
        "e1c1142f86a986c93195549fac550b22",
        "8dfe1e6cba0ff0192a249f234cafcf32",
        "3e37f2938360a06f83443e8857392a71",
        "1bd01842cde157b6bd55f983e3afab6b",
        "ab46bfd2f4cfcb53b642d2afa3f68242",
    )
    .to_string()
}

fn default_wireguard_udp_ports() -> Vec<u16> {
    vec![443, 88, 1224, 51820, 500, 4500]
}

fn default_wireguard_tcp_ports() -> Vec<u16> {
    vec![443, 3389, 8080, 8443]
}

fn default_wireguard_tls_ports() -> Vec<u16> {
    vec![443]
}

fn default_ikev2_ports() -> Vec<u16> {
    vec![500]
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

/// Get the config directory path
fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_NAME))
}

fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|p| p.join(CONFIG_FILE))
}

/// Load the cached Smart Protocol config from disk, falling back to the
/// shipped defaults on any problem.
pub fn load_config() -> SmartProtocolConfig {
    let path = match get_config_path() {
        Some(p) => p,
        None => {
            debug!("Could not determine config path, using defaults");
            return SmartProtocolConfig::default();
        }
    };

    if !path.exists() {
        debug!("Smart protocol config does not exist, using defaults");
        return SmartProtocolConfig::default();
    }

    match fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(config) => {
                info!("Loaded smart protocol config from {:?}", path);
                config
            }
            Err(e) => {
                error!("Failed to parse smart protocol config: {}", e);
                SmartProtocolConfig::default()
            }
        },
        Err(e) => {
            error!("Failed to read smart protocol config: {}", e);
            SmartProtocolConfig::default()
        }
    }
}

/// Persist the Smart Protocol config (typically after a remote client config
/// fetch by the caller).
pub fn save_config(config: &SmartProtocolConfig) -> Result<(), String> {
    let dir = match get_config_dir() {
        Some(d) => d,
        None => return Err("Could not determine config directory".to_string()),
    };

    if !dir.exists() {
        if let Err(e) = fs::create_dir_all(&dir) {
            return Err(format!("Failed to create config directory: {}", e));
        }
    }

    let path = dir.join(CONFIG_FILE);

    let json = match serde_json::to_string_pretty(config) {
        Ok(j) => j,
        Err(e) => return Err(format!("Failed to serialize config: {}", e)),
    };

    match fs::write(&path, json) {
        Ok(_) => {
            info!("Saved smart protocol config to {:?}", path);
            Ok(())
        }
        Err(e) => Err(format!("Failed to write config file: {}", e)),
    }
}
