//! Local agent connection monitoring
//!
//! Once the tunnel is up, an in-tunnel agent pushes state changes, errors
//! and feature confirmations to the client. This module turns that wire
//! traffic into a typed state machine the application layer can observe.
//!
//! ## Architecture
//!
//! - types.rs: agent protocol constants and total wire-to-type mappings
//! - agent.rs: the state machine, its delegate and the command channel

pub mod agent;
pub mod types;

pub use agent::{AgentCommand, AgentDelegate, AgentEvent, LocalAgent};
pub use types::{
    AgentError, AgentState, ConnectionDetails, FeatureStatistics, WireConnectionDetails,
    WireStatistics, WireStatusMessage,
};
