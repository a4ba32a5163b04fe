use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Reference to a not-yet-materialized dependency embedded in an
/// argument tree. Carries the referent's fingerprint so the enclosing
/// task can be fingerprinted before the dependency has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FutureRef {
    pub task_id: i64,
    pub fingerprint: String,
}

/// Tagged-variant argument node.
///
/// Serialized trees are the wire form of `args_blob` / `kwargs_blob`:
/// maps use `BTreeMap` so the canonical JSON rendering is byte-stable,
/// which the fingerprint depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
    Future(FutureRef),
}

impl ArgValue {
    /// Walk the tree and yield every embedded future, in order of first
    /// appearance.
    pub fn collect_futures(&self, out: &mut Vec<FutureRef>) {
        match self {
            ArgValue::Future(fr) => {
                if !out.iter().any(|f| f.task_id == fr.task_id) {
                    out.push(fr.clone());
                }
            }
            ArgValue::List(items) => {
                for item in items {
                    item.collect_futures(out);
                }
            }
            ArgValue::Map(entries) => {
                for value in entries.values() {
                    value.collect_futures(out);
                }
            }
            _ => {}
        }
    }

    /// Substitute resolved dependency values at every future placeholder.
    /// Placeholders with no entry in `resolved` are left in place; the
    /// caller decides whether that is an error.
    pub fn resolve(&self, resolved: &HashMap<i64, ArgValue>) -> ArgValue {
        match self {
            ArgValue::Future(fr) => resolved
                .get(&fr.task_id)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            ArgValue::List(items) => {
                ArgValue::List(items.iter().map(|item| item.resolve(resolved)).collect())
            }
            ArgValue::Map(entries) => ArgValue::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.resolve(resolved)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// The tree as it participates in the fingerprint: every future node
    /// replaced by its referent's fingerprint string.
    pub fn fingerprint_form(&self) -> ArgValue {
        match self {
            ArgValue::Future(fr) => ArgValue::Str(fr.fingerprint.clone()),
            ArgValue::List(items) => {
                ArgValue::List(items.iter().map(ArgValue::fingerprint_form).collect())
            }
            ArgValue::Map(entries) => ArgValue::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.fingerprint_form()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgValue::Float(v) => Some(*v),
            ArgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ArgValue]> {
        match self {
            ArgValue::List(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(v: Vec<T>) -> Self {
        ArgValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<FutureRef> for ArgValue {
    fn from(v: FutureRef) -> Self {
        ArgValue::Future(v)
    }
}

/// Collect futures over a whole positional + named argument set, in
/// order of appearance (positionals first).
pub fn collect_arg_futures(
    args: &[ArgValue],
    kwargs: &BTreeMap<String, ArgValue>,
) -> Vec<FutureRef> {
    let mut out = Vec::new();
    for arg in args {
        arg.collect_futures(&mut out);
    }
    for value in kwargs.values() {
        value.collect_futures(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fr(id: i64) -> FutureRef {
        FutureRef {
            task_id: id,
            fingerprint: format!("fp-{id}"),
        }
    }

    #[test]
    fn collects_futures_in_order() {
        let args = vec![
            ArgValue::List(vec![ArgValue::Future(fr(3)), ArgValue::Int(1)]),
            ArgValue::Future(fr(1)),
            ArgValue::Future(fr(3)), // duplicate, kept once
        ];
        let found = collect_arg_futures(&args, &BTreeMap::new());
        let ids: Vec<i64> = found.iter().map(|f| f.task_id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn resolve_substitutes_placeholders() {
        let tree = ArgValue::List(vec![ArgValue::Future(fr(7)), ArgValue::Str("x".into())]);
        let mut resolved = HashMap::new();
        resolved.insert(7, ArgValue::Float(0.5));
        assert_eq!(
            tree.resolve(&resolved),
            ArgValue::List(vec![ArgValue::Float(0.5), ArgValue::Str("x".into())])
        );
    }

    #[test]
    fn fingerprint_form_replaces_future_with_fingerprint() {
        let tree = ArgValue::Future(fr(2));
        assert_eq!(tree.fingerprint_form(), ArgValue::Str("fp-2".into()));
    }

    #[test]
    fn canonical_json_is_stable() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), ArgValue::Int(2));
        map.insert("a".to_string(), ArgValue::Int(1));
        let one = serde_json::to_string(&ArgValue::Map(map.clone())).unwrap();
        let two = serde_json::to_string(&ArgValue::Map(map)).unwrap();
        assert_eq!(one, two);
    }
}
