//! Flow-node state machine.
//!
//! Every transition locks the process instance and then the flow node, opens a
//! transaction, runs state behaviors until the node reaches a stable state, persists each
//! change through the recorder, archives terminal nodes, commits and releases the locks
//! in reverse order. Continuations (the next flow nodes, triggers, child cancellation)
//! are queued as works that only run once the transaction committed.

mod archive;
mod behavior;
mod executor;
mod flow;
mod lifecycle;
mod messaging;
mod state;

pub use executor::{FlowNodeExecutor, FlowNodeServices};
pub use state::{FlowNodeState, TransitionOutcome};

pub(crate) const PROCESS_INSTANCE_LOCK: &str = "process_instance";
pub(crate) const FLOW_NODE_INSTANCE_LOCK: &str = "flow_node_instance";
pub(crate) const MESSAGE_LOCK: &str = "message_matching";

/// External stimulus carried into a transition.
#[derive(Debug, Clone, Default)]
pub(crate) enum Stimulus {
    /// Plain execution: resume from the current state.
    #[default]
    Execute,
    /// A message, signal, timer or child completion reached the node.
    Trigger(crate::Vars),
    /// A user submits a user task.
    UserExecution {
        user_id: crate::UserId,
        inputs: crate::Vars,
    },
}
