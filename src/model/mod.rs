mod contract;
mod node;
mod process;
mod transition;

pub use contract::{ConstraintDefinition, ContractDefinition, InputDefinition, InputType};
pub use node::{DataMapping, EventTrigger, FlowNodeDefinition, FlowNodeKind, FlowNodeType, Operation, Operator};
pub use process::{ActorDefinition, DataDefinition, ParameterDefinition, ProcessDefinition};
pub use transition::TransitionDefinition;
