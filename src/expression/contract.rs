use serde_json::{Map, Value, json};

use crate::{
    ProcflowError, Result, Vars,
    expression::{ExpressionEvaluator, DefaultExpressionEvaluator},
    model::{ContractDefinition, InputDefinition, InputType},
};

/// Checks the inputs handed to a process start or a user task execution.
pub trait ContractValidator: Send + Sync {
    fn validate(
        &self,
        contract: &ContractDefinition,
        inputs: &Vars,
    ) -> Result<()>;
}

/// Turns the contract inputs into a JSON schema, then evaluates the constraints.
pub struct JsonSchemaContractValidator {
    evaluator: Box<dyn ExpressionEvaluator>,
}

impl Default for JsonSchemaContractValidator {
    fn default() -> Self {
        Self::new(Box::new(DefaultExpressionEvaluator))
    }
}

impl JsonSchemaContractValidator {
    pub fn new(evaluator: Box<dyn ExpressionEvaluator>) -> Self {
        Self {
            evaluator,
        }
    }

    pub fn schema(contract: &ContractDefinition) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for input in &contract.inputs {
            properties.insert(input.name.clone(), input_schema(input));
            if input.required {
                required.push(Value::String(input.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn input_schema(input: &InputDefinition) -> Value {
    let item = match input.input_type {
        InputType::Text => json!({ "type": "string" }),
        InputType::Integer => json!({ "type": "integer" }),
        InputType::Decimal => json!({ "type": "number" }),
        InputType::Boolean => json!({ "type": "boolean" }),
        InputType::Date => json!({ "type": "string", "pattern": r"^\d{4}-\d{2}-\d{2}" }),
        InputType::Complex => json!({ "type": "object" }),
    };
    if input.multiple {
        json!({ "type": "array", "items": item })
    } else {
        item
    }
}

impl ContractValidator for JsonSchemaContractValidator {
    fn validate(
        &self,
        contract: &ContractDefinition,
        inputs: &Vars,
    ) -> Result<()> {
        let schema = Self::schema(contract);
        let validator = jsonschema::validator_for(&schema).map_err(|e| ProcflowError::Contract(e.to_string()))?;
        let instance: Value = inputs.clone().into();
        let errors: Vec<String> = validator.iter_errors(&instance).map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            return Err(ProcflowError::Contract(errors.join("; ")));
        }

        for constraint in &contract.constraints {
            let ok = self
                .evaluator
                .evaluate_bool(&constraint.expression, inputs)
                .map_err(|e| ProcflowError::Contract(format!("constraint '{}' could not be evaluated: {}", constraint.name, e)))?;
            if !ok {
                let explanation = if constraint.explanation.is_empty() { &constraint.name } else { &constraint.explanation };
                return Err(ProcflowError::Contract(format!("constraint '{}' violated: {}", constraint.name, explanation)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn contract() -> ContractDefinition {
        serde_json::from_value(json!({
            "inputs": [
                { "name": "amount", "type": "integer" },
                { "name": "tags", "type": "text", "multiple": true, "required": false }
            ],
            "constraints": [
                {
                    "name": "positive",
                    "expression": {
                        "type": "condition",
                        "conditions": [{ "variable_selector": "amount", "comparison_operator": "gt", "value": "0" }]
                    },
                    "explanation": "amount must be positive"
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_accepts_valid_inputs() {
        let validator = JsonSchemaContractValidator::default();
        validator.validate(&contract(), &Vars::new().with("amount", 10).with("tags", json!(["a"]))).unwrap();
        validator.validate(&contract(), &Vars::new().with("amount", 1)).unwrap();
    }

    #[test]
    fn test_rejects_invalid_inputs() {
        let validator = JsonSchemaContractValidator::default();
        let missing = validator.validate(&contract(), &Vars::new());
        assert!(matches!(missing, Err(ProcflowError::Contract(_))));

        let wrong_type = validator.validate(&contract(), &Vars::new().with("amount", "ten"));
        assert!(matches!(wrong_type, Err(ProcflowError::Contract(_))));

        let violated = validator.validate(&contract(), &Vars::new().with("amount", -3)).unwrap_err();
        assert!(violated.to_string().contains("amount must be positive"));
    }
}
