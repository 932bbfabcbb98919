//! Typed view of the agent wire protocol
//!
//! The in-tunnel agent reports connection state as short string identifiers,
//! errors as integer codes and everything else as JSON status messages. The
//! mappings here are total: values this client version does not know come
//! back as `Unknown(raw)` instead of failing, so a server-side protocol
//! extension can never wedge the state machine.

use std::fmt;
use std::net::IpAddr;

use log::warn;
use serde::Deserialize;

use crate::features::ConnectionFeatures;

pub const STATE_CONNECTING: &str = "Connecting";
pub const STATE_CONNECTED: &str = "Connected";
pub const STATE_SOFT_JAILED: &str = "Soft Jailed";
pub const STATE_HARD_JAILED: &str = "Hard Jailed";
pub const STATE_CONNECTION_ERROR: &str = "Connection Error";
pub const STATE_SERVER_CERTIFICATE_ERROR: &str = "Server Certificate Error";
pub const STATE_DISCONNECTED: &str = "Disconnected";

const ERR_GUEST_SESSION: i32 = 86100;
const ERR_CERTIFICATE_EXPIRED: i32 = 86101;
const ERR_CERTIFICATE_REVOKED: i32 = 86102;
const ERR_KEY_USED_MULTIPLE_TIMES: i32 = 86103;
const ERR_RESTRICTED_SERVER: i32 = 86104;
const ERR_BAD_CERTIFICATE_SIGNATURE: i32 = 86105;
const ERR_CERTIFICATE_NOT_PROVIDED: i32 = 86106;
const ERR_MAX_SESSIONS_UNKNOWN: i32 = 86110;
const ERR_MAX_SESSIONS_FREE: i32 = 86111;
const ERR_MAX_SESSIONS_BASIC: i32 = 86112;
const ERR_MAX_SESSIONS_PLUS: i32 = 86113;
const ERR_MAX_SESSIONS_VISIONARY: i32 = 86114;
const ERR_MAX_SESSIONS_PRO: i32 = 86115;
const ERR_SERVER_ERROR: i32 = 86150;
const ERR_POLICY_VIOLATION_LOW_PLAN: i32 = 86151;
const ERR_POLICY_VIOLATION_DELINQUENT: i32 = 86152;
const ERR_USER_TORRENT_NOT_ALLOWED: i32 = 86153;
const ERR_USER_BAD_BEHAVIOR: i32 = 86154;

/// Agent connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    Connected,
    /// Recoverable policy hold; lifted by pushing `jail: false` features.
    SoftJailed,
    HardJailed,
    ConnectionError,
    ServerCertificateError,
    Disconnected,
    Unknown(String),
}

impl AgentState {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            STATE_CONNECTING => AgentState::Connecting,
            STATE_CONNECTED => AgentState::Connected,
            STATE_SOFT_JAILED => AgentState::SoftJailed,
            STATE_HARD_JAILED => AgentState::HardJailed,
            STATE_CONNECTION_ERROR => AgentState::ConnectionError,
            STATE_SERVER_CERTIFICATE_ERROR => AgentState::ServerCertificateError,
            STATE_DISCONNECTED => AgentState::Disconnected,
            other => AgentState::Unknown(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            AgentState::Connecting => STATE_CONNECTING,
            AgentState::Connected => STATE_CONNECTED,
            AgentState::SoftJailed => STATE_SOFT_JAILED,
            AgentState::HardJailed => STATE_HARD_JAILED,
            AgentState::ConnectionError => STATE_CONNECTION_ERROR,
            AgentState::ServerCertificateError => STATE_SERVER_CERTIFICATE_ERROR,
            AgentState::Disconnected => STATE_DISCONNECTED,
            AgentState::Unknown(raw) => raw,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, AgentState::Connected)
    }

    pub fn is_jailed(&self) -> bool {
        matches!(self, AgentState::SoftJailed | AgentState::HardJailed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Errors the agent reports over the tunnel. The messages are surfaced to
/// the user verbatim, so they stay readable rather than technical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("Session is not authenticated with the server")]
    GuestSession,

    #[error("VPN certificate has expired")]
    CertificateExpired,

    #[error("VPN certificate was revoked by the server")]
    CertificateRevoked,

    #[error("Connection key was used by another session")]
    KeyUsedMultipleTimes,

    #[error("Server is restricted, waiting for it to recover")]
    RestrictedServer,

    #[error("VPN certificate signature was rejected by the server")]
    BadCertificateSignature,

    #[error("No VPN certificate was provided to the server")]
    CertificateNotProvided,

    #[error("Maximum number of concurrent sessions reached")]
    MaxSessionsUnknown,

    #[error("Maximum number of concurrent sessions for the Free plan reached")]
    MaxSessionsFree,

    #[error("Maximum number of concurrent sessions for the Basic plan reached")]
    MaxSessionsBasic,

    #[error("Maximum number of concurrent sessions for the Plus plan reached")]
    MaxSessionsPlus,

    #[error("Maximum number of concurrent sessions for the Visionary plan reached")]
    MaxSessionsVisionary,

    #[error("Maximum number of concurrent sessions for the Professional plan reached")]
    MaxSessionsPro,

    #[error("Server error")]
    ServerError,

    #[error("Current subscription plan does not allow connecting to this server")]
    PolicyViolationLowPlan,

    #[error("Account has unpaid invoices")]
    PolicyViolationDelinquent,

    #[error("Torrenting is not allowed on this server")]
    UserTorrentNotAllowed,

    #[error("Session was terminated for policy reasons")]
    UserBadBehavior,

    #[error("Unknown agent error code {0}")]
    Unknown(i32),
}

impl AgentError {
    pub fn from_code(code: i32) -> Self {
        match code {
            ERR_GUEST_SESSION => AgentError::GuestSession,
            ERR_CERTIFICATE_EXPIRED => AgentError::CertificateExpired,
            ERR_CERTIFICATE_REVOKED => AgentError::CertificateRevoked,
            ERR_KEY_USED_MULTIPLE_TIMES => AgentError::KeyUsedMultipleTimes,
            ERR_RESTRICTED_SERVER => AgentError::RestrictedServer,
            ERR_BAD_CERTIFICATE_SIGNATURE => AgentError::BadCertificateSignature,
            ERR_CERTIFICATE_NOT_PROVIDED => AgentError::CertificateNotProvided,
            ERR_MAX_SESSIONS_UNKNOWN => AgentError::MaxSessionsUnknown,
            ERR_MAX_SESSIONS_FREE => AgentError::MaxSessionsFree,
            ERR_MAX_SESSIONS_BASIC => AgentError::MaxSessionsBasic,
            ERR_MAX_SESSIONS_PLUS => AgentError::MaxSessionsPlus,
            ERR_MAX_SESSIONS_VISIONARY => AgentError::MaxSessionsVisionary,
            ERR_MAX_SESSIONS_PRO => AgentError::MaxSessionsPro,
            ERR_SERVER_ERROR => AgentError::ServerError,
            ERR_POLICY_VIOLATION_LOW_PLAN => AgentError::PolicyViolationLowPlan,
            ERR_POLICY_VIOLATION_DELINQUENT => AgentError::PolicyViolationDelinquent,
            ERR_USER_TORRENT_NOT_ALLOWED => AgentError::UserTorrentNotAllowed,
            ERR_USER_BAD_BEHAVIOR => AgentError::UserBadBehavior,
            other => AgentError::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            AgentError::GuestSession => ERR_GUEST_SESSION,
            AgentError::CertificateExpired => ERR_CERTIFICATE_EXPIRED,
            AgentError::CertificateRevoked => ERR_CERTIFICATE_REVOKED,
            AgentError::KeyUsedMultipleTimes => ERR_KEY_USED_MULTIPLE_TIMES,
            AgentError::RestrictedServer => ERR_RESTRICTED_SERVER,
            AgentError::BadCertificateSignature => ERR_BAD_CERTIFICATE_SIGNATURE,
            AgentError::CertificateNotProvided => ERR_CERTIFICATE_NOT_PROVIDED,
            AgentError::MaxSessionsUnknown => ERR_MAX_SESSIONS_UNKNOWN,
            AgentError::MaxSessionsFree => ERR_MAX_SESSIONS_FREE,
            AgentError::MaxSessionsBasic => ERR_MAX_SESSIONS_BASIC,
            AgentError::MaxSessionsPlus => ERR_MAX_SESSIONS_PLUS,
            AgentError::MaxSessionsVisionary => ERR_MAX_SESSIONS_VISIONARY,
            AgentError::MaxSessionsPro => ERR_MAX_SESSIONS_PRO,
            AgentError::ServerError => ERR_SERVER_ERROR,
            AgentError::PolicyViolationLowPlan => ERR_POLICY_VIOLATION_LOW_PLAN,
            AgentError::PolicyViolationDelinquent => ERR_POLICY_VIOLATION_DELINQUENT,
            AgentError::UserTorrentNotAllowed => ERR_USER_TORRENT_NOT_ALLOWED,
            AgentError::UserBadBehavior => ERR_USER_BAD_BEHAVIOR,
            AgentError::Unknown(code) => *code,
        }
    }

    /// Certificate is stale or missing; a plain refresh fixes it.
    pub fn requires_certificate_refresh(&self) -> bool {
        matches!(
            self,
            AgentError::CertificateExpired | AgentError::CertificateNotProvided
        )
    }

    /// The current keypair is burned; the client must regenerate keys and
    /// fetch a certificate for the new ones.
    pub fn requires_key_regeneration(&self) -> bool {
        matches!(
            self,
            AgentError::BadCertificateSignature
                | AgentError::CertificateRevoked
                | AgentError::KeyUsedMultipleTimes
        )
    }

    pub fn is_max_sessions(&self) -> bool {
        matches!(
            self,
            AgentError::MaxSessionsUnknown
                | AgentError::MaxSessionsFree
                | AgentError::MaxSessionsBasic
                | AgentError::MaxSessionsPlus
                | AgentError::MaxSessionsVisionary
                | AgentError::MaxSessionsPro
        )
    }

    /// Account-level refusals that no amount of retrying can fix.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            AgentError::PolicyViolationLowPlan
                | AgentError::PolicyViolationDelinquent
                | AgentError::UserTorrentNotAllowed
                | AgentError::UserBadBehavior
        )
    }
}

/// Status update as it arrives from the agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireStatusMessage {
    #[serde(default)]
    pub features: Option<ConnectionFeatures>,

    #[serde(rename = "connection-details", default)]
    pub connection_details: Option<WireConnectionDetails>,

    #[serde(rename = "statistics", default)]
    pub statistics: Option<WireStatistics>,
}

/// Connection diagnostics with addresses still in string form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireConnectionDetails {
    #[serde(rename = "exit-ip", default)]
    pub exit_ip: Option<String>,

    #[serde(rename = "device-ip", default)]
    pub device_ip: Option<String>,

    #[serde(rename = "device-country", default)]
    pub device_country: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireStatistics {
    #[serde(rename = "netshield", default)]
    pub netshield: Option<FeatureStatistics>,
}

/// NetShield counters. Only `bytes_saved` is always reported; the other
/// counters are absent when the active configuration does not track them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct FeatureStatistics {
    #[serde(rename = "ads-blocked", default)]
    pub ads_blocked: Option<u64>,

    #[serde(rename = "trackers-blocked", default)]
    pub trackers_blocked: Option<u64>,

    #[serde(rename = "bytes-saved", default)]
    pub bytes_saved: u64,
}

/// Parsed connection diagnostics. This is best-effort data for display, a
/// malformed address becomes an absent field rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionDetails {
    pub exit_ip: Option<IpAddr>,
    pub device_ip: Option<IpAddr>,
    pub device_country: Option<String>,
}

impl ConnectionDetails {
    pub fn from_wire(wire: &WireConnectionDetails) -> Self {
        ConnectionDetails {
            exit_ip: parse_ip("exit-ip", wire.exit_ip.as_deref()),
            device_ip: parse_ip("device-ip", wire.device_ip.as_deref()),
            device_country: wire.device_country.clone(),
        }
    }
}

fn parse_ip(field: &str, raw: Option<&str>) -> Option<IpAddr> {
    let raw = raw?;
    match raw.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            warn!("Dropping malformed {} address in agent status: {}", field, raw);
            None
        }
    }
}
