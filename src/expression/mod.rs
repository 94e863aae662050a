//! Expression evaluation, contract validation and identity lookups consumed by the
//! flow-node state machine.

mod condition;
mod contract;
mod identity;
mod template;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use condition::{ComparisonOperator, Condition, ConditionValue, LogicalOperator};
pub use contract::{ContractValidator, JsonSchemaContractValidator};
pub use identity::{IdentityService, MemIdentityService, Membership};

use crate::{ProcflowError, Result, Vars};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
    Constant {
        value: Value,
    },
    /// Dotted path into the context, e.g. `order.customer.name`.
    Variable {
        name: String,
    },
    /// String with `${path}` placeholders.
    Template {
        template: String,
    },
    Condition {
        #[serde(default)]
        logical_operator: LogicalOperator,
        conditions: Vec<Condition>,
    },
}

impl Expression {
    pub fn constant(value: impl Into<Value>) -> Self {
        Expression::Constant {
            value: value.into(),
        }
    }

    pub fn variable(name: &str) -> Self {
        Expression::Variable {
            name: name.to_string(),
        }
    }

    pub fn template(template: &str) -> Self {
        Expression::Template {
            template: template.to_string(),
        }
    }
}

pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        expression: &Expression,
        context: &Vars,
    ) -> Result<Value>;

    fn evaluate_bool(
        &self,
        expression: &Expression,
        context: &Vars,
    ) -> Result<bool> {
        match self.evaluate(expression, context)? {
            Value::Bool(b) => Ok(b),
            other => Err(ProcflowError::Expression(format!("expected a boolean, got {}", other))),
        }
    }

    /// Evaluates to a string; non-string values use their JSON text, null gives `None`.
    fn evaluate_string(
        &self,
        expression: &Expression,
        context: &Vars,
    ) -> Result<Option<String>> {
        match self.evaluate(expression, context)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DefaultExpressionEvaluator;

impl ExpressionEvaluator for DefaultExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &Expression,
        context: &Vars,
    ) -> Result<Value> {
        match expression {
            Expression::Constant {
                value,
            } => Ok(value.clone()),
            Expression::Variable {
                name,
            } => context.lookup(name).ok_or_else(|| ProcflowError::Expression(format!("variable '{}' not found", name))),
            Expression::Template {
                template,
            } => template::resolve(context, template),
            Expression::Condition {
                logical_operator,
                conditions,
            } => Ok(Value::Bool(condition::evaluate_all(context, conditions, *logical_operator))),
        }
    }
}
