//! Expression evaluation against live resources.
//!
//! Expressions arrive pre-compiled from an external compiler. The engine only
//! needs to evaluate them against a binding of resource id to live object.
//! [`PathExpressionEngine`] is the built-in engine and understands:
//! - bare references: `database.status.podIP`, `web.spec.ports[0].port`
//! - string templates: `http://${service.spec.clusterIP}:${service.spec.ports[0].port}`
//! - JSON literals: `3`, `"text"`, `true`

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::path::FieldPath;
use crate::{Error, Result};

/// Resource id to live resource.
pub type Bindings = HashMap<String, Value>;

/// Evaluates opaque expressions.
pub trait ExpressionEngine: Send + Sync {
    /// Evaluate `expression` against `bindings`.
    ///
    /// Failures are reported as [`Error::CelExpression`], naming the identifier
    /// that could not be resolved when there is one.
    fn evaluate(&self, expression: &str, bindings: &Bindings) -> Result<Value>;
}

// Identifiers followed by a member or index access, not themselves a member.
static IDENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^A-Za-z0-9_.$"'])([A-Za-z_][A-Za-z0-9_]*)\s*[.\[]"#).unwrap()
});

// ${...} template segments
static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

static PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_\-]+|\[[^\]]+\])*$").unwrap()
});

/// Root identifiers an expression refers to, in order of first appearance.
pub fn identifiers(expression: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in IDENT_REGEX.captures_iter(expression) {
        let ident = caps[1].to_string();
        if !out.contains(&ident) {
            out.push(ident);
        }
    }
    out
}

/// The default expression engine: path lookups, `${}` templates and literals.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathExpressionEngine;

impl PathExpressionEngine {
    pub fn new() -> Self {
        Self
    }

    fn lookup(&self, expression: &str, path: &str, bindings: &Bindings) -> Result<Value> {
        let path = path.trim();
        if !PATH_REGEX.is_match(path) {
            return Err(Error::CelExpression {
                expression: expression.to_string(),
                identifier: None,
                message: format!("unsupported expression `{path}`"),
            });
        }

        let split = path.find(['.', '[']).unwrap_or(path.len());
        let (root, rest) = path.split_at(split);
        let live = bindings.get(root).ok_or_else(|| Error::CelExpression {
            expression: expression.to_string(),
            identifier: Some(root.to_string()),
            message: format!("unknown identifier `{root}`"),
        })?;

        let field_path =
            FieldPath::parse(rest.strip_prefix('.').unwrap_or(rest)).map_err(|message| {
                Error::CelExpression {
                    expression: expression.to_string(),
                    identifier: Some(root.to_string()),
                    message,
                }
            })?;

        field_path
            .lookup(live)
            .cloned()
            .ok_or_else(|| Error::CelExpression {
                expression: expression.to_string(),
                identifier: Some(root.to_string()),
                message: format!("`{path}` is not set on `{root}`"),
            })
    }
}

impl ExpressionEngine for PathExpressionEngine {
    fn evaluate(&self, expression: &str, bindings: &Bindings) -> Result<Value> {
        let trimmed = expression.trim();

        if TEMPLATE_REGEX.is_match(trimmed) {
            // A template made of exactly one segment keeps the value's type.
            if let Some(caps) = TEMPLATE_REGEX.captures(trimmed) {
                if caps.get(0).map(|m| m.as_str().len()) == Some(trimmed.len()) {
                    return self.lookup(expression, &caps[1], bindings);
                }
            }

            let mut out = String::new();
            let mut last = 0;
            for caps in TEMPLATE_REGEX.captures_iter(trimmed) {
                let Some(whole) = caps.get(0) else { continue };
                out.push_str(&trimmed[last..whole.start()]);
                match self.lookup(expression, &caps[1], bindings)? {
                    Value::String(s) => out.push_str(&s),
                    other => out.push_str(&other.to_string()),
                }
                last = whole.end();
            }
            out.push_str(&trimmed[last..]);
            return Ok(Value::String(out));
        }

        if let Ok(literal) = serde_json::from_str::<Value>(trimmed) {
            return Ok(literal);
        }

        self.lookup(expression, trimmed, bindings)
    }
}
