use regex::Regex;
use serde_json::Value;

use crate::{ProcflowError, Result, Vars};

/// Placeholder format: `${path}` or `${path.sub.key}`
const TEMPLATE_PATTERN: &str = r"\$\{([^}]+)\}";

/// Resolves `${..}` placeholders against `context`.
///
/// A template made of a single placeholder evaluates to the raw value; otherwise every
/// placeholder is rendered into the surrounding text. Unknown variables are an error.
pub(super) fn resolve(
    context: &Vars,
    template: &str,
) -> Result<Value> {
    let re = Regex::new(TEMPLATE_PATTERN).map_err(|e| ProcflowError::Expression(e.to_string()))?;

    if let Some(caps) = re.captures(template) {
        if &caps[0] == template {
            let path = caps[1].trim();
            return context.lookup(path).ok_or_else(|| ProcflowError::Expression(format!("variable '{}' not found", path)));
        }
    }

    let mut result = template.to_string();
    let mut errors: Vec<String> = Vec::new();
    for caps in re.captures_iter(template) {
        let full_match = &caps[0];
        let path = caps[1].trim();
        match context.lookup(path) {
            Some(value) => {
                let text = match value {
                    Value::String(s) => s,
                    v => v.to_string(),
                };
                result = result.replace(full_match, &text);
            }
            None => errors.push(format!("variable '{}' not found", path)),
        }
    }

    if !errors.is_empty() {
        return Err(ProcflowError::Expression(errors.join(", ")));
    }
    Ok(Value::String(result))
}
