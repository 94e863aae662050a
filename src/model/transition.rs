use serde::{Deserialize, Serialize};

use crate::expression::Expression;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Guard evaluated when leaving a gateway; ignored on other sources.
    #[serde(default)]
    pub condition: Option<Expression>,
}
