//! Field paths into JSON-like values.
//!
//! Paths use dot notation with bracket indices: `status.loadBalancer.ingress[0].ip`.
//! Keys containing dots can be quoted inside brackets: `metadata.labels["app.kubernetes.io/name"]`.

use serde_json::Value;
use std::fmt;

/// A single step in a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a path expression. The empty string is the root path.
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let chars: Vec<char> = input.chars().collect();
        let mut i = 0;
        let mut key = String::new();

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    if key.is_empty() && (i == 0 || chars[i - 1] != ']') {
                        return Err(format!("empty segment at position {i} in `{input}`"));
                    }
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                    i += 1;
                }
                '[' => {
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|p| p + i)
                        .ok_or_else(|| format!("unclosed `[` in `{input}`"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    segments.push(parse_bracket(&inner, input)?);
                    i = close + 1;
                }
                c => {
                    key.push(c);
                    i += 1;
                }
            }
        }

        if !key.is_empty() {
            segments.push(Segment::Key(key));
        } else if input.ends_with('.') {
            return Err(format!("trailing `.` in `{input}`"));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Look up the value at this path.
    pub fn lookup<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Key(k), Value::Object(map)) => map.get(k)?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn parse_bracket(inner: &str, input: &str) -> Result<Segment, String> {
    let trimmed = inner.trim();
    if let Some(quoted) = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
    {
        return Ok(Segment::Key(quoted.to_string()));
    }
    trimmed
        .parse::<usize>()
        .map(Segment::Index)
        .map_err(|_| format!("invalid index `[{inner}]` in `{input}`"))
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(k) if k.contains('.') => write!(f, "[\"{k}\"]")?,
                Segment::Key(k) if i == 0 => write!(f, "{k}")?,
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for FieldPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_dots_and_indices() {
        let path = FieldPath::parse("status.loadBalancer.ingress[0].ip").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("status".into()),
                Segment::Key("loadBalancer".into()),
                Segment::Key("ingress".into()),
                Segment::Index(0),
                Segment::Key("ip".into()),
            ]
        );
    }

    #[test]
    fn test_parse_quoted_key() {
        let path = FieldPath::parse(r#"metadata.labels["app.kubernetes.io/name"]"#).unwrap();
        assert_eq!(
            path.segments()[2],
            Segment::Key("app.kubernetes.io/name".into())
        );
    }

    #[test]
    fn test_lookup() {
        let value = json!({
            "spec": { "ports": [ { "port": 80 }, { "port": 443 } ] }
        });
        let path = FieldPath::parse("spec.ports[1].port").unwrap();
        assert_eq!(path.lookup(&value), Some(&json!(443)));

        let missing = FieldPath::parse("spec.ports[5].port").unwrap();
        assert_eq!(missing.lookup(&value), None);
    }

    #[test]
    fn test_root_path_returns_whole_value() {
        let value = json!({"a": 1});
        let path = FieldPath::parse("").unwrap();
        assert!(path.is_root());
        assert_eq!(path.lookup(&value), Some(&value));
    }

    #[test]
    fn test_invalid_paths() {
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse("a[").is_err());
        assert!(FieldPath::parse("a[x]").is_err());
        assert!(FieldPath::parse("a.").is_err());
    }

    #[test]
    fn test_display_round_trips_shape() {
        let path = FieldPath::parse(r#"a.b[2]["c.d"]"#).unwrap();
        assert_eq!(path.to_string(), r#"a.b[2]["c.d"]"#);
    }
}
