//! Placeholder values embedded in manifests.
//!
//! A manifest is an opaque JSON tree, except for two kinds of placeholder
//! nodes that stand in for values only known once other resources exist:
//!
//! - a structural reference: `{"$ref": {"resourceId": "db", "fieldPath": "status.podIP"}}`
//! - an opaque expression: `{"$expr": "db.status.readyReplicas > 0"}`
//!
//! A placeholder must be the only key of its object; anything else is a literal.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::expression;

pub const REF_KEY: &str = "$ref";
pub const EXPR_KEY: &str = "$expr";

/// Points at a field of another resource's live object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralRef {
    pub resource_id: String,
    pub field_path: String,
}

impl StructuralRef {
    pub fn new(resource_id: impl Into<String>, field_path: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            field_path: field_path.into(),
        }
    }

    /// Key used by the resolver cache.
    pub fn cache_key(&self) -> String {
        format!("{}.{}", self.resource_id, self.field_path)
    }
}

/// An expression produced by an external compiler, evaluated against live resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Expression(pub String);

impl Expression {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A value that is not known until deploy time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Ref(StructuralRef),
    Expr(Expression),
}

impl Placeholder {
    pub fn reference(resource_id: impl Into<String>, field_path: impl Into<String>) -> Self {
        Self::Ref(StructuralRef::new(resource_id, field_path))
    }

    pub fn expression(expr: impl Into<String>) -> Self {
        Self::Expr(Expression(expr.into()))
    }

    /// Encode as a manifest node.
    pub fn to_value(&self) -> Value {
        match self {
            Placeholder::Ref(r) => json!({ REF_KEY: r }),
            Placeholder::Expr(e) => json!({ EXPR_KEY: e.0 }),
        }
    }

    /// Recognize a placeholder node. Malformed markers are treated as literals.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        if let Some(inner) = map.get(REF_KEY) {
            return serde_json::from_value(inner.clone()).ok().map(Placeholder::Ref);
        }
        map.get(EXPR_KEY)
            .and_then(Value::as_str)
            .map(|s| Placeholder::Expr(Expression(s.to_string())))
    }

    /// Resource ids this placeholder may depend on.
    pub fn referenced_ids(&self) -> Vec<String> {
        match self {
            Placeholder::Ref(r) => vec![r.resource_id.clone()],
            Placeholder::Expr(e) => expression::identifiers(e.as_str()),
        }
    }
}

impl From<Placeholder> for Value {
    fn from(p: Placeholder) -> Self {
        p.to_value()
    }
}

/// Classification of a manifest node.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<'a> {
    Literal(&'a Value),
    Placeholder(Placeholder),
}

impl<'a> Slot<'a> {
    pub fn classify(value: &'a Value) -> Self {
        match Placeholder::from_value(value) {
            Some(p) => Slot::Placeholder(p),
            None => Slot::Literal(value),
        }
    }
}

/// True if `value` or anything beneath it is a placeholder.
pub fn contains_placeholder(value: &Value) -> bool {
    if Placeholder::from_value(value).is_some() {
        return true;
    }
    match value {
        Value::Object(map) => map.values().any(contains_placeholder),
        Value::Array(items) => items.iter().any(contains_placeholder),
        _ => false,
    }
}

/// Collect every placeholder in the tree, depth first.
pub fn collect_placeholders(value: &Value) -> Vec<Placeholder> {
    let mut out = Vec::new();
    walk(value, &mut out);
    out
}

fn walk(value: &Value, out: &mut Vec<Placeholder>) {
    if let Some(p) = Placeholder::from_value(value) {
        out.push(p);
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|v| walk(v, out)),
        Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
        _ => {}
    }
}
