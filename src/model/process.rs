use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ProcflowError, Result,
    expression::Expression,
    model::{ContractDefinition, FlowNodeDefinition, TransitionDefinition},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub flow_nodes: Vec<FlowNodeDefinition>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    #[serde(default)]
    pub actors: Vec<ActorDefinition>,
    /// Contract checked against the inputs given to `start_process`.
    #[serde(default)]
    pub contract: Option<ContractDefinition>,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub data: Vec<DataDefinition>,
    /// Up to five expressions evaluated at start into the instance's search index.
    #[serde(default)]
    pub string_indexes: Vec<Expression>,
}

impl ProcessDefinition {
    pub fn from_json(s: &str) -> Result<Self> {
        let definition = serde_json::from_str::<ProcessDefinition>(s);
        match definition {
            Ok(v) => Ok(v),
            Err(e) => Err(ProcflowError::Definition(format!("{}", e))),
        }
    }

    pub fn flow_node(
        &self,
        id: &str,
    ) -> Option<&FlowNodeDefinition> {
        self.flow_nodes.iter().find(|n| n.id == id)
    }

    pub fn actor(
        &self,
        name: &str,
    ) -> Option<&ActorDefinition> {
        self.actors.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// The actor allowed to start the process.
    #[serde(default)]
    pub initiator: bool,
}

/// Process data declared by the definition and created on every instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDefinition {
    pub name: String,
    #[serde(default)]
    pub default_value: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}
