use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::model::FlowNodeType;

/// Lifecycle state of a flow-node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlowNodeState {
    Initializing,
    Ready,
    Executing,
    Waiting,
    Completing,
    Completed,
    Failed,
    Aborting,
    Aborted,
    Cancelling,
    Cancelled,
}

impl FlowNodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowNodeState::Completed | FlowNodeState::Aborted | FlowNodeState::Cancelled)
    }

    /// Whether an instance of `kind` may be left in this state between two transitions.
    pub fn is_stable_for(
        &self,
        kind: FlowNodeType,
    ) -> bool {
        match self {
            FlowNodeState::Completed | FlowNodeState::Aborted | FlowNodeState::Cancelled | FlowNodeState::Failed => true,
            FlowNodeState::Ready => kind == FlowNodeType::UserTask,
            FlowNodeState::Waiting => matches!(
                kind,
                FlowNodeType::IntermediateCatchEvent
                    | FlowNodeType::BoundaryEvent
                    | FlowNodeType::ReceiveTask
                    | FlowNodeType::CallActivity
                    | FlowNodeType::ExclusiveGateway
                    | FlowNodeType::ParallelGateway
                    | FlowNodeType::InclusiveGateway
            ),
            _ => false,
        }
    }
}

/// Result of a synchronous transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub flow_node_instance_id: u64,
    pub state: FlowNodeState,
    pub stable: bool,
    pub terminal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stability() {
        assert!(FlowNodeState::Ready.is_stable_for(FlowNodeType::UserTask));
        assert!(!FlowNodeState::Ready.is_stable_for(FlowNodeType::AutomaticTask));
        assert!(FlowNodeState::Waiting.is_stable_for(FlowNodeType::ParallelGateway));
        assert!(FlowNodeState::Waiting.is_stable_for(FlowNodeType::CallActivity));
        assert!(!FlowNodeState::Waiting.is_stable_for(FlowNodeType::UserTask));
        assert!(!FlowNodeState::Executing.is_stable_for(FlowNodeType::ReceiveTask));
        assert!(FlowNodeState::Failed.is_stable_for(FlowNodeType::AutomaticTask));
        assert!(!FlowNodeState::Failed.is_terminal());
        assert!(FlowNodeState::Cancelled.is_terminal());
    }

    #[test]
    fn test_names() {
        assert_eq!(FlowNodeState::Completing.as_ref(), "completing");
        assert_eq!(serde_json::to_string(&FlowNodeState::Aborted).unwrap(), "\"aborted\"");
        assert_eq!("waiting".parse::<FlowNodeState>().unwrap(), FlowNodeState::Waiting);
    }
}
