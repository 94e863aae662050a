use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Vars;

/// Logical operator
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// Comparison operator
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ComparisonOperator {
    // for string or array
    Contains,
    NotContains,
    StartWith,
    EndWith,
    Is,
    IsNot,
    Empty,
    NotEmpty,
    In,
    NotIn,
    AllOf,
    // for number
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Null,
    NotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Str(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into the evaluation context.
    pub variable_selector: String,
    pub comparison_operator: ComparisonOperator,
    pub value: Option<ConditionValue>,
}

pub(super) fn evaluate_all(
    context: &Vars,
    conditions: &[Condition],
    logical_operator: LogicalOperator,
) -> bool {
    let mut results = conditions.iter().map(|c| evaluate(&context.lookup(&c.variable_selector), c.comparison_operator, &c.value));
    match logical_operator {
        LogicalOperator::And => results.all(|r| r),
        LogicalOperator::Or => results.any(|r| r),
    }
}

fn evaluate(
    actual: &Option<Value>,
    operator: ComparisonOperator,
    expected: &Option<ConditionValue>,
) -> bool {
    match operator {
        ComparisonOperator::Null => actual.is_none() || matches!(actual, Some(Value::Null)),
        ComparisonOperator::NotNull => actual.is_some() && !matches!(actual, Some(Value::Null)),
        ComparisonOperator::Empty => match actual {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(arr)) => arr.is_empty(),
            Some(Value::Object(obj)) => obj.is_empty(),
            _ => false,
        },
        ComparisonOperator::NotEmpty => !evaluate(actual, ComparisonOperator::Empty, expected),
        _ => {
            let (Some(actual), Some(expected)) = (actual, expected) else {
                return false;
            };
            evaluate_with_value(actual, operator, expected)
        }
    }
}

fn evaluate_with_value(
    actual: &Value,
    operator: ComparisonOperator,
    expected: &ConditionValue,
) -> bool {
    match operator {
        ComparisonOperator::Contains => eval_contains(actual, expected),
        ComparisonOperator::NotContains => !eval_contains(actual, expected),
        ComparisonOperator::StartWith => matches!((actual, expected), (Value::String(s), ConditionValue::Str(e)) if s.starts_with(e.as_str())),
        ComparisonOperator::EndWith => matches!((actual, expected), (Value::String(s), ConditionValue::Str(e)) if s.ends_with(e.as_str())),
        ComparisonOperator::Is => eval_is(actual, expected),
        ComparisonOperator::IsNot => !eval_is(actual, expected),
        ComparisonOperator::In => eval_in(actual, expected),
        ComparisonOperator::NotIn => !eval_in(actual, expected),
        ComparisonOperator::AllOf => match (actual, expected) {
            (Value::Array(arr), ConditionValue::List(list)) => list.iter().all(|e| arr.iter().any(|v| v.as_str() == Some(e.as_str()))),
            _ => false,
        },
        ComparisonOperator::Eq => eval_eq(actual, expected),
        ComparisonOperator::Ne => !eval_eq(actual, expected),
        ComparisonOperator::Gt => eval_cmp(actual, expected, |a, b| a > b),
        ComparisonOperator::Lt => eval_cmp(actual, expected, |a, b| a < b),
        ComparisonOperator::Ge => eval_cmp(actual, expected, |a, b| a >= b),
        ComparisonOperator::Le => eval_cmp(actual, expected, |a, b| a <= b),
        _ => false,
    }
}

fn eval_contains(
    actual: &Value,
    expected: &ConditionValue,
) -> bool {
    match (actual, expected) {
        (Value::String(s), ConditionValue::Str(e)) => s.contains(e.as_str()),
        (Value::Array(arr), ConditionValue::Str(e)) => arr.iter().any(|v| v.as_str() == Some(e.as_str())),
        _ => false,
    }
}

fn eval_is(
    actual: &Value,
    expected: &ConditionValue,
) -> bool {
    match (actual, expected) {
        (Value::String(s), ConditionValue::Str(e)) => s == e,
        (Value::Bool(b), ConditionValue::Str(e)) => (*b && e == "true") || (!*b && e == "false"),
        _ => false,
    }
}

fn eval_in(
    actual: &Value,
    expected: &ConditionValue,
) -> bool {
    match expected {
        ConditionValue::List(list) => match actual {
            Value::String(s) => list.contains(s),
            Value::Number(n) => list.contains(&n.to_string()),
            _ => false,
        },
        ConditionValue::Str(s) => match actual {
            Value::String(a) => s.contains(a.as_str()),
            _ => false,
        },
    }
}

fn eval_eq(
    actual: &Value,
    expected: &ConditionValue,
) -> bool {
    match (actual, expected) {
        (Value::Number(n), ConditionValue::Str(s)) => s.parse::<f64>().is_ok_and(|e| n.as_f64() == Some(e)),
        (Value::String(a), ConditionValue::Str(e)) => a == e,
        (Value::Bool(b), ConditionValue::Str(e)) => b.to_string() == *e,
        _ => false,
    }
}

fn eval_cmp<F>(
    actual: &Value,
    expected: &ConditionValue,
    cmp: F,
) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (actual, expected) {
        (Value::Number(n), ConditionValue::Str(s)) => match (n.as_f64(), s.parse::<f64>()) {
            (Some(a), Ok(e)) => cmp(a, e),
            _ => false,
        },
        _ => false,
    }
}
