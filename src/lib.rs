//! KestrelVPN Core Library
//!
//! Connection and session lifecycle for the KestrelVPN client: Smart
//! Protocol availability checking and negotiation, background certificate
//! refresh with retry/backoff, the authenticated API layer, and the local
//! agent state machine. Used by the desktop and tunnel-extension processes.

pub mod api;
pub mod cert_refresh;
pub mod config;
pub mod features;
pub mod keys;
pub mod local_agent;
pub mod smart_protocol;
pub mod storage;

// Re-export commonly used items
pub use api::ApiClient;
pub use api::ApiEnvironment;
pub use api::ApiError;
pub use cert_refresh::CertRefreshError;
pub use cert_refresh::CertificateRefreshManager;
pub use cert_refresh::{ProviderRequest, ProviderResponse};
pub use config::SmartProtocolConfig;
pub use features::ConnectionFeatures;
pub use local_agent::{AgentError, AgentState, LocalAgent};
pub use smart_protocol::{
    AvailabilityResult, NegotiatedProtocol, ServerEndpoint, SmartProtocolNegotiator, VpnProtocol,
};
pub use storage::SessionStorage;
