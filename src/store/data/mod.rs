//! Entities stored by the engine.

mod actor;
mod audit;
mod definition;
mod flow_node;
mod incident;
mod process;
mod variable;
mod waiting;

pub use actor::{Actor, ActorMember, ActorMemberKind};
pub use audit::AuditLog;
pub use definition::{ActivationState, ProcessDefinitionInfo};
pub use flow_node::{ArchivedFlowNodeInstance, FlowNodeInstance};
pub use incident::Incident;
pub use process::{ArchivedProcessInstance, ProcessInstance, ProcessState};
pub use variable::DataInstance;
pub use waiting::{MessageInstance, WaitingEvent, WaitingEventKind};
