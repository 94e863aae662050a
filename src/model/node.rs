use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expression::Expression;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: FlowNodeKind,
}

impl FlowNodeDefinition {
    pub fn node_type(&self) -> FlowNodeType {
        self.kind.node_type()
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNodeKind {
    StartEvent {
        #[serde(default)]
        trigger: Option<EventTrigger>,
    },
    EndEvent {
        /// Aborts every other flow node of the process when reached.
        #[serde(default)]
        terminate: bool,
    },
    AutomaticTask {
        #[serde(default)]
        operations: Vec<Operation>,
    },
    UserTask {
        actor: String,
        #[serde(default)]
        contract: Option<super::ContractDefinition>,
        #[serde(default)]
        operations: Vec<Operation>,
    },
    ReceiveTask {
        message: String,
        #[serde(default)]
        correlation: Option<Expression>,
        /// Message payload keys copied into process data.
        #[serde(default)]
        outputs: Vec<DataMapping>,
    },
    SendTask {
        message: String,
        #[serde(default)]
        correlation: Option<Expression>,
        #[serde(default)]
        payload: Vec<DataMapping>,
    },
    CallActivity {
        /// Name of the called process definition.
        process: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        inputs: Vec<DataMapping>,
        #[serde(default)]
        outputs: Vec<DataMapping>,
    },
    ExclusiveGateway {
        #[serde(default)]
        default_transition: Option<String>,
    },
    ParallelGateway,
    InclusiveGateway {
        #[serde(default)]
        default_transition: Option<String>,
    },
    IntermediateCatchEvent {
        trigger: EventTrigger,
        #[serde(default)]
        outputs: Vec<DataMapping>,
    },
    IntermediateThrowEvent {
        trigger: EventTrigger,
        #[serde(default)]
        payload: Vec<DataMapping>,
    },
    BoundaryEvent {
        attached_to: String,
        #[serde(default = "default_interrupting")]
        interrupting: bool,
        trigger: EventTrigger,
    },
}

fn default_interrupting() -> bool {
    true
}

impl FlowNodeKind {
    pub fn node_type(&self) -> FlowNodeType {
        match self {
            FlowNodeKind::StartEvent {
                ..
            } => FlowNodeType::StartEvent,
            FlowNodeKind::EndEvent {
                ..
            } => FlowNodeType::EndEvent,
            FlowNodeKind::AutomaticTask {
                ..
            } => FlowNodeType::AutomaticTask,
            FlowNodeKind::UserTask {
                ..
            } => FlowNodeType::UserTask,
            FlowNodeKind::ReceiveTask {
                ..
            } => FlowNodeType::ReceiveTask,
            FlowNodeKind::SendTask {
                ..
            } => FlowNodeType::SendTask,
            FlowNodeKind::CallActivity {
                ..
            } => FlowNodeType::CallActivity,
            FlowNodeKind::ExclusiveGateway {
                ..
            } => FlowNodeType::ExclusiveGateway,
            FlowNodeKind::ParallelGateway => FlowNodeType::ParallelGateway,
            FlowNodeKind::InclusiveGateway {
                ..
            } => FlowNodeType::InclusiveGateway,
            FlowNodeKind::IntermediateCatchEvent {
                ..
            } => FlowNodeType::IntermediateCatchEvent,
            FlowNodeKind::IntermediateThrowEvent {
                ..
            } => FlowNodeType::IntermediateThrowEvent,
            FlowNodeKind::BoundaryEvent {
                ..
            } => FlowNodeType::BoundaryEvent,
        }
    }

    /// Trigger of a start, catch, throw or boundary event.
    pub fn trigger(&self) -> Option<&EventTrigger> {
        match self {
            FlowNodeKind::StartEvent {
                trigger,
            } => trigger.as_ref(),
            FlowNodeKind::IntermediateCatchEvent {
                trigger,
                ..
            }
            | FlowNodeKind::IntermediateThrowEvent {
                trigger,
                ..
            }
            | FlowNodeKind::BoundaryEvent {
                trigger,
                ..
            } => Some(trigger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::AsRefStr, strum::EnumString, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlowNodeType {
    StartEvent,
    EndEvent,
    AutomaticTask,
    UserTask,
    ReceiveTask,
    SendTask,
    CallActivity,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    BoundaryEvent,
}

impl FlowNodeType {
    pub fn is_gateway(&self) -> bool {
        matches!(self, FlowNodeType::ExclusiveGateway | FlowNodeType::ParallelGateway | FlowNodeType::InclusiveGateway)
    }

    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            FlowNodeType::AutomaticTask | FlowNodeType::UserTask | FlowNodeType::ReceiveTask | FlowNodeType::SendTask | FlowNodeType::CallActivity
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventTrigger {
    /// Exactly one of `duration_ms`, `date` or `cycle` (a 6-field cron expression) is set.
    Timer {
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        date: Option<DateTime<Utc>>,
        #[serde(default)]
        cycle: Option<String>,
    },
    Message {
        name: String,
        #[serde(default)]
        correlation: Option<Expression>,
    },
    Signal {
        name: String,
    },
}

impl EventTrigger {
    pub fn is_timer(&self) -> bool {
        matches!(self, EventTrigger::Timer { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Assign,
    /// Pushes onto an array, creating it when missing.
    Append,
}

/// Writes the value of `expression` into the process data named `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub target: String,
    #[serde(default)]
    pub operator: Operator,
    pub expression: Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMapping {
    pub source: Expression,
    pub target: String,
}
