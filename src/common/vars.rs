//! JSON variable map used for process data, contract inputs and message payloads.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vars {
    inner: Map<String, Value>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Serialize>(
        mut self,
        name: &str,
        value: T,
    ) -> Self {
        self.set(name, value);
        self
    }

    pub fn set<T: Serialize>(
        &mut self,
        name: &str,
        value: T,
    ) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.inner.insert(name.to_string(), value);
    }

    /// Typed read; `None` when missing or not convertible.
    pub fn get<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Option<T> {
        self.inner.get(name).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_value(
        &self,
        name: &str,
    ) -> Option<&Value> {
        self.inner.get(name)
    }

    /// Resolves a dotted path such as `order.customer.name`.
    pub fn lookup(
        &self,
        path: &str,
    ) -> Option<Value> {
        let mut keys = path.split('.');
        let first = keys.next()?;
        let mut current = self.inner.get(first)?;
        for key in keys {
            current = match current {
                Value::Object(obj) => obj.get(key)?,
                Value::Array(arr) => arr.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.inner.contains_key(name)
    }

    pub fn remove(
        &mut self,
        name: &str,
    ) -> Option<Value> {
        self.inner.remove(name)
    }

    /// Copies every entry of `other` into `self`, overwriting on conflict.
    pub fn extend(
        &mut self,
        other: &Vars,
    ) {
        for (k, v) in other.iter() {
            self.inner.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl From<Value> for Vars {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(inner) => Self {
                inner,
            },
            _ => Self::default(),
        }
    }
}

impl From<Vars> for Value {
    fn from(vars: Vars) -> Self {
        Value::Object(vars.inner)
    }
}

impl FromIterator<(String, Value)> for Vars {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_lookup_nested_path() {
        let vars = Vars::from(json!({ "order": { "lines": [{ "qty": 3 }], "id": "A1" } }));
        assert_eq!(vars.lookup("order.id"), Some(json!("A1")));
        assert_eq!(vars.lookup("order.lines.0.qty"), Some(json!(3)));
        assert_eq!(vars.lookup("order.missing"), None);
        assert_eq!(vars.lookup("nothing"), None);
    }

    #[test]
    fn test_typed_get_and_extend() {
        let mut a = Vars::new().with("n", 4).with("s", "x");
        assert_eq!(a.get::<i64>("n"), Some(4));
        assert_eq!(a.get::<i64>("s"), None);

        a.extend(&Vars::new().with("n", 5));
        assert_eq!(a.get::<i64>("n"), Some(5));
        assert_eq!(a.len(), 2);
    }
}
