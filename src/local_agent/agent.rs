//! Agent connection state machine
//!
//! Consumes the event stream of an active tunnel connection and keeps a
//! typed picture of it: current state, last error, connection diagnostics
//! and NetShield counters. The application layer observes changes through a
//! delegate; commands travel the other way over a channel drained by the
//! tunnel backend.
//!
//! All event handling is fail-soft. Unknown states and error codes are
//! logged and dropped without a transition, malformed diagnostic fields
//! degrade to absent values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::types::{
    AgentError, AgentState, ConnectionDetails, FeatureStatistics, WireStatusMessage,
};
use crate::features::{ConnectionFeatures, NatType, NetShieldLevel};

/// Observer interface for the application layer.
pub trait AgentDelegate: Send + Sync {
    fn did_change_state(&self, state: &AgentState);
    fn did_receive_error(&self, error: &AgentError);
    fn did_receive_features(&self, features: &ConnectionFeatures);
    fn did_receive_connection_details(&self, details: &ConnectionDetails);
    fn did_update_statistics(&self, statistics: &FeatureStatistics);
}

/// Inbound events from the tunnel-side agent connection.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// State identifier as it appeared on the wire.
    State(String),
    /// Integer error code as it appeared on the wire.
    Error(i32),
    Status(WireStatusMessage),
}

/// Commands delivered to the tunnel backend.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    SetFeatures(ConnectionFeatures),
    RequestStatus { with_stats: bool },
    Disconnect,
}

pub struct LocalAgent {
    delegate: Arc<dyn AgentDelegate>,
    commands: mpsc::UnboundedSender<AgentCommand>,
    state: Mutex<AgentState>,
    last_error: Mutex<Option<AgentError>>,
    connection_details: Mutex<Option<ConnectionDetails>>,
    statistics: Mutex<Option<FeatureStatistics>>,
    features: Mutex<ConnectionFeatures>,
    just_connected: AtomicBool,
}

impl LocalAgent {
    /// Returns the agent and the receiving end of its command channel. The
    /// tunnel backend drains the receiver and applies the commands to the
    /// underlying agent connection.
    pub fn new(
        delegate: Arc<dyn AgentDelegate>,
        features: ConnectionFeatures,
    ) -> (Self, mpsc::UnboundedReceiver<AgentCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let agent = LocalAgent {
            delegate,
            commands,
            state: Mutex::new(AgentState::Disconnected),
            last_error: Mutex::new(None),
            connection_details: Mutex::new(None),
            statistics: Mutex::new(None),
            features: Mutex::new(features),
            just_connected: AtomicBool::new(false),
        };
        (agent, receiver)
    }

    pub fn state(&self) -> AgentState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or(AgentState::Disconnected)
    }

    pub fn last_error(&self) -> Option<AgentError> {
        self.last_error.lock().ok().and_then(|error| *error)
    }

    pub fn connection_details(&self) -> Option<ConnectionDetails> {
        self.connection_details
            .lock()
            .ok()
            .and_then(|details| details.clone())
    }

    pub fn statistics(&self) -> Option<FeatureStatistics> {
        self.statistics.lock().ok().and_then(|stats| *stats)
    }

    /// Feature set the client currently proposes to the agent.
    pub fn features(&self) -> ConnectionFeatures {
        self.features
            .lock()
            .map(|features| features.clone())
            .unwrap_or_default()
    }

    /// Drains the event stream until the tunnel backend drops the sender.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<AgentEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Agent event stream closed");
    }

    pub fn handle_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::State(raw) => self.handle_state(&raw),
            AgentEvent::Error(code) => self.handle_error(code),
            AgentEvent::Status(message) => self.handle_status(message),
        }
    }

    fn handle_state(&self, raw: &str) {
        let next = AgentState::from_wire(raw);
        if let AgentState::Unknown(identifier) = &next {
            warn!("Ignoring unknown agent state \"{}\"", identifier);
            return;
        }

        let changed = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            if *state == next {
                false
            } else {
                // The first features reported after connecting still
                // describe the previous connection and must not be trusted
                let fresh_connection =
                    *state == AgentState::Connecting && next == AgentState::Connected;
                self.just_connected.store(fresh_connection, Ordering::SeqCst);
                *state = next.clone();
                true
            }
        };

        if changed {
            info!("Agent state changed to {}", next);
            self.delegate.did_change_state(&next);
        } else {
            debug!("Agent repeated state {}", next);
        }
    }

    fn handle_error(&self, code: i32) {
        let error = AgentError::from_code(code);
        if let AgentError::Unknown(code) = error {
            warn!("Ignoring unknown agent error code {}", code);
            return;
        }

        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error);
        }
        self.delegate.did_receive_error(&error);
    }

    fn handle_status(&self, message: WireStatusMessage) {
        if let Some(wire) = &message.connection_details {
            let details = ConnectionDetails::from_wire(wire);
            if let Ok(mut slot) = self.connection_details.lock() {
                *slot = Some(details.clone());
            }
            self.delegate.did_receive_connection_details(&details);
        }

        if let Some(stats) = message.statistics.as_ref().and_then(|wire| wire.netshield) {
            if let Ok(mut slot) = self.statistics.lock() {
                *slot = Some(stats);
            }
            self.delegate.did_update_statistics(&stats);
        }

        if let Some(features) = message.features {
            self.handle_reported_features(features);
        }
    }

    fn handle_reported_features(&self, features: ConnectionFeatures) {
        let state = self.state();
        // States like Hard Jailed report features with NetShield forced off;
        // acting on those would corrupt the user's settings
        if !state.is_connected() {
            debug!("Not checking features in {} state", state);
            return;
        }
        if self.just_connected.swap(false, Ordering::SeqCst) {
            debug!("Not checking features right after connecting");
            return;
        }
        self.delegate.did_receive_features(&features);
    }

    pub fn update_netshield(&self, level: NetShieldLevel) {
        let features = self.mutate_features(|features| features.netshield = level);
        self.send(AgentCommand::SetFeatures(features));
    }

    pub fn update_vpn_accelerator(&self, enabled: bool) {
        let features = self.mutate_features(|features| features.vpn_accelerator = enabled);
        self.send(AgentCommand::SetFeatures(features));
    }

    pub fn update_nat_type(&self, nat: NatType) {
        let features = self.mutate_features(|features| features.set_nat_type(nat));
        self.send(AgentCommand::SetFeatures(features));
    }

    pub fn update_safe_mode(&self, enabled: bool) {
        let features = self.mutate_features(|features| features.safe_mode = Some(enabled));
        self.send(AgentCommand::SetFeatures(features));
    }

    /// Asks the agent to lift a soft jail. The jail key is one-shot and is
    /// not retained in the current feature set.
    pub fn unjail(&self) {
        self.send(AgentCommand::SetFeatures(self.features().unjail()));
    }

    pub fn request_status(&self, with_stats: bool) {
        self.send(AgentCommand::RequestStatus { with_stats });
    }

    /// Requests a disconnect from the tunnel backend. The state stays as-is
    /// until the agent reports the transition; only the counters reset now.
    pub fn disconnect(&self) {
        self.send(AgentCommand::Disconnect);
        if let Ok(mut slot) = self.statistics.lock() {
            *slot = None;
        }
        self.delegate.did_update_statistics(&FeatureStatistics::default());
    }

    fn mutate_features(
        &self,
        apply: impl FnOnce(&mut ConnectionFeatures),
    ) -> ConnectionFeatures {
        match self.features.lock() {
            Ok(mut guard) => {
                apply(&mut guard);
                guard.clone()
            }
            Err(_) => ConnectionFeatures::default(),
        }
    }

    fn send(&self, command: AgentCommand) {
        if self.commands.send(command).is_err() {
            warn!("Tunnel backend command channel is closed");
        }
    }
}
