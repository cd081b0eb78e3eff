//! Coordinator lifecycle state and bookkeeping types

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SealMode;

/// Lifecycle state of a coordinator
///
/// ```text
/// Uninitialized --start--> AcceptingManifest --set_manifest--> AcceptingMarbles
///       |                                                          ^
///       +--start (sealed state, key unavailable)--> Recovery --recover--+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    Uninitialized,
    Recovery,
    AcceptingManifest,
    AcceptingMarbles,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Uninitialized => "Uninitialized",
            State::Recovery => "Recovery",
            State::AcceptingManifest => "AcceptingManifest",
            State::AcceptingMarbles => "AcceptingMarbles",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activation counters
///
/// Counters only grow; they survive `stop` and reset with the process.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub activation_count: u64,
    pub failed_activations: u64,
    pub last_activation: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            activation_count: 0,
            failed_activations: 0,
            last_activation: None,
            start_time: Utc::now(),
        }
    }
}

/// A live, admitted marble instance
#[derive(Debug, Clone, Serialize)]
pub struct MarbleInstance {
    pub marble_type: String,
    pub instance_id: String,
    pub package: String,
    pub activated_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Point-in-time coordinator status
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_fingerprint: Option<String>,
    pub active_marbles: usize,
    pub stats: Stats,
    pub recovery_key_holders: Vec<String>,
    pub seal_mode: SealMode,
    pub simulation_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_by_name() {
        assert_eq!(
            serde_json::to_string(&State::AcceptingMarbles).unwrap(),
            "\"AcceptingMarbles\""
        );
        assert_eq!(State::Recovery.to_string(), "Recovery");
    }
}
