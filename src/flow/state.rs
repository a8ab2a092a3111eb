use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

/// Lifecycle of a flow inside the runtime. Phases only move forward;
/// `Stopping` can be entered from any active phase and `Disposed` from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum FlowState {
    Declared,
    NodesLoaded,
    Started,
    ConfigNodesReady,
    Running,
    Stopping,
    NodesStopped,
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("flow {flow_id} cannot go from {from} to {to}")]
pub struct InvalidTransition {
    pub flow_id: String,
    pub from: FlowState,
    pub to: FlowState,
}

impl FlowState {
    pub fn can_advance_to(self, next: FlowState) -> bool {
        use FlowState::*;
        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Declared, NodesLoaded)
            | (NodesLoaded, Started)
            | (Started, ConfigNodesReady)
            | (ConfigNodesReady, Running)
            | (Stopping, NodesStopped) => true,
            (NodesLoaded | Started | ConfigNodesReady | Running, Stopping) => true,
            _ => false,
        }
    }

    /// Nodes are loaded and have not been told to stop.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            FlowState::NodesLoaded | FlowState::Started | FlowState::ConfigNodesReady | FlowState::Running
        )
    }
}

#[cfg(test)]
mod tests {
    use super::FlowState::*;

    #[test]
    fn phases_only_move_forward() {
        assert!(Declared.can_advance_to(NodesLoaded));
        assert!(NodesLoaded.can_advance_to(Started));
        assert!(Started.can_advance_to(ConfigNodesReady));
        assert!(ConfigNodesReady.can_advance_to(Running));
        assert!(!Running.can_advance_to(Started));
        assert!(!NodesLoaded.can_advance_to(Running));
        assert!(!Declared.can_advance_to(Stopping));
    }

    #[test]
    fn stop_and_dispose_from_active_phases() {
        for state in [NodesLoaded, Started, ConfigNodesReady, Running] {
            assert!(state.is_active());
            assert!(state.can_advance_to(Stopping));
            assert!(state.can_advance_to(Disposed));
        }
        assert!(Stopping.can_advance_to(NodesStopped));
        assert!(!Disposed.can_advance_to(Disposed));
        assert_eq!(ConfigNodesReady.to_string(), "configNodesReady");
    }
}
