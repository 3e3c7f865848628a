//! RS-008: Template assertions. Compare a rendered template with an
//! expected fragment and report mismatching JSON paths.

use serde_json::Value;
use std::fmt;

/// How strictly a template must match the expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchStyle {
    /// Same keys and values everywhere
    Exact,
    /// Objects may carry keys the expectation doesn't mention
    #[default]
    Superset,
}

impl fmt::Display for MatchStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Superset => write!(f, "superset"),
        }
    }
}

impl std::str::FromStr for MatchStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "superset" => Ok(Self::Superset),
            other => Err(format!("unknown match style '{}' (exact|superset)", other)),
        }
    }
}

fn short(v: &Value) -> String {
    let s = v.to_string();
    if s.len() > 60 {
        let cut = (0..=57).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0);
        format!("{}...", &s[..cut])
    } else {
        s
    }
}

fn walk(path: &str, actual: &Value, expected: &Value, style: MatchStyle, out: &mut Vec<String>) {
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => {
            for (key, ev) in e {
                let child = format!("{}.{}", path, key);
                match a.get(key) {
                    Some(av) => walk(&child, av, ev, style, out),
                    None => out.push(format!("{}: missing", child)),
                }
            }
            if style == MatchStyle::Exact {
                for key in a.keys().filter(|k| !e.contains_key(*k)) {
                    out.push(format!("{}.{}: unexpected", path, key));
                }
            }
        }
        (Value::Array(a), Value::Array(e)) => {
            if a.len() != e.len() {
                out.push(format!(
                    "{}: expected {} elements, found {}",
                    path,
                    e.len(),
                    a.len()
                ));
                return;
            }
            for (i, (av, ev)) in a.iter().zip(e).enumerate() {
                walk(&format!("{}[{}]", path, i), av, ev, style, out);
            }
        }
        (a, e) if a == e => {}
        (a, e) => out.push(format!("{}: expected {}, found {}", path, short(e), short(a))),
    }
}

/// Compare `actual` against `expected`. Returns the mismatching JSON paths,
/// empty when the template matches.
pub fn match_template(actual: &Value, expected: &Value, style: MatchStyle) -> Vec<String> {
    let mut out = Vec::new();
    walk("$", actual, expected, style, &mut out);
    out
}

/// Resources of one CloudFormation type, as `(logical id, entry)`.
pub fn resources_of_type<'a>(template: &'a Value, resource_type: &str) -> Vec<(&'a String, &'a Value)> {
    template
        .get("Resources")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter(|(_, r)| r.get("Type").and_then(Value::as_str) == Some(resource_type))
                .collect()
        })
        .unwrap_or_default()
}

pub fn count_resources(template: &Value, resource_type: &str) -> usize {
    resources_of_type(template, resource_type).len()
}
