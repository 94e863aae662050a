//! Filters, ordering and paging over document bodies.

use std::cmp::Ordering;

use serde_json::Value;

use super::Document;

#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
}

impl Cond {
    pub fn matches(
        &self,
        doc: &Document,
    ) -> bool {
        match self {
            Cond::Eq(field, value) => field_of(doc, field) == *value,
            Cond::Ne(field, value) => field_of(doc, field) != *value,
            Cond::In(field, values) => values.contains(&field_of(doc, field)),
            Cond::IsNull(field) => field_of(doc, field).is_null(),
            Cond::NotNull(field) => !field_of(doc, field).is_null(),
        }
    }
}

fn field_of(
    doc: &Document,
    field: &str,
) -> Value {
    match field {
        "id" => Value::from(doc.id),
        "tenant_id" => Value::from(doc.tenant_id),
        _ => doc.field(field).cloned().unwrap_or(Value::Null),
    }
}

fn compare(
    a: &Value,
    b: &Value,
) -> Ordering {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().unwrap_or_default().partial_cmp(&b.as_f64().unwrap_or_default()).unwrap_or(Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Conjunction of conditions with ordering and paging.
#[derive(Debug, Clone, Default)]
pub struct Query {
    filter: Vec<Cond>,
    order_by: Vec<(String, bool)>,
    limit: Option<usize>,
    offset: usize,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(
        mut self,
        cond: Cond,
    ) -> Self {
        self.filter.push(cond);
        self
    }

    pub fn eq(
        self,
        field: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.filter(Cond::Eq(field.to_string(), value.into()))
    }

    pub fn ne(
        self,
        field: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.filter(Cond::Ne(field.to_string(), value.into()))
    }

    /// Orders by `field`; `rev` sorts descending.
    pub fn order_by(
        mut self,
        field: &str,
        rev: bool,
    ) -> Self {
        self.order_by.push((field.to_string(), rev));
        self
    }

    pub fn limit(
        mut self,
        limit: usize,
    ) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(
        mut self,
        offset: usize,
    ) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(
        &self,
        doc: &Document,
    ) -> bool {
        self.filter.iter().all(|c| c.matches(doc))
    }

    /// Filters, sorts and pages `docs`. Without ordering, documents keep id order.
    pub fn apply(
        &self,
        docs: impl IntoIterator<Item = Document>,
    ) -> Vec<Document> {
        let mut rows: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();
        rows.sort_by(|a, b| {
            for (field, rev) in self.order_by.iter() {
                let ord = compare(&field_of(a, field), &field_of(b, field));
                let ord = if *rev { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.id.cmp(&b.id)
        });
        let rows = rows.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }

    pub fn count(
        &self,
        docs: impl IntoIterator<Item = Document>,
    ) -> usize {
        docs.into_iter().filter(|d| self.matches(d)).count()
    }
}
