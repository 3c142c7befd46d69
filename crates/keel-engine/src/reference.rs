//! Input references.
//!
//! A step input may embed placeholders that are replaced at dispatch time:
//!
//! - `{"$from": "<tool>", "pointer": "/a/b"}`: the output of a dependency,
//!   optionally narrowed by a JSON pointer.
//! - `{"$memory": {"namespace": "<ns>", "key": "<key>"}}`: a value read from
//!   the memory store.
//!
//! Placeholders can appear at any depth. An object is a placeholder only when
//! it carries one of the marker keys.

use keel_core::{MemoryKey, Namespace};
use serde_json::{Map, Value};

const FROM: &str = "$from";
const POINTER: &str = "pointer";
const MEMORY: &str = "$memory";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRef {
    From {
        step: String,
        pointer: Option<String>,
    },
    Memory {
        namespace: Namespace,
        key: MemoryKey,
    },
}

fn parse(object: &Map<String, Value>) -> Option<Result<InputRef, String>> {
    if let Some(source) = object.get(FROM) {
        return Some(parse_from(object, source));
    }
    object.get(MEMORY).map(|target| parse_memory(object, target))
}

fn parse_from(object: &Map<String, Value>, source: &Value) -> Result<InputRef, String> {
    if let Some(extra) = object.keys().find(|k| *k != FROM && *k != POINTER) {
        return Err(format!("unexpected key '{extra}' next to {FROM}"));
    }
    let step = source
        .as_str()
        .ok_or_else(|| format!("{FROM} must name a step"))?
        .to_string();
    let pointer = match object.get(POINTER) {
        None => None,
        Some(Value::String(p)) if p.is_empty() || p.starts_with('/') => Some(p.clone()),
        Some(_) => return Err(format!("{POINTER} must be a JSON pointer such as \"/field\"")),
    };
    Ok(InputRef::From { step, pointer })
}

fn parse_memory(object: &Map<String, Value>, target: &Value) -> Result<InputRef, String> {
    if object.len() != 1 {
        return Err(format!("{MEMORY} must be the only key of its object"));
    }
    let field = |name: &str| {
        target
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("{MEMORY} needs a string '{name}'"))
    };
    let namespace = Namespace::parse(field("namespace")?).map_err(|e| e.to_string())?;
    let key = MemoryKey::parse(field("key")?).map_err(|e| e.to_string())?;
    Ok(InputRef::Memory { namespace, key })
}

/// Every placeholder in `value`, in document order.
pub fn collect(value: &Value) -> Vec<Result<InputRef, String>> {
    let mut found = Vec::new();
    walk(value, &mut found);
    found
}

fn walk(value: &Value, found: &mut Vec<Result<InputRef, String>>) {
    match value {
        Value::Object(object) => match parse(object) {
            Some(reference) => found.push(reference),
            None => object.values().for_each(|v| walk(v, found)),
        },
        Value::Array(items) => items.iter().for_each(|v| walk(v, found)),
        _ => {}
    }
}

/// Copy of `value` with every placeholder replaced by `lookup`'s answer.
pub fn substitute<F>(value: &Value, lookup: &mut F) -> Result<Value, String>
where
    F: FnMut(&InputRef) -> Result<Value, String>,
{
    match value {
        Value::Object(object) => match parse(object) {
            Some(reference) => lookup(&reference?),
            None => object
                .iter()
                .map(|(k, v)| Ok((k.clone(), substitute(v, lookup)?)))
                .collect::<Result<Map<_, _>, String>>()
                .map(Value::Object),
        },
        Value::Array(items) => items
            .iter()
            .map(|v| substitute(v, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Narrow a dependency's output by an optional JSON pointer.
pub fn select(output: &Value, step: &str, pointer: Option<&str>) -> Result<Value, String> {
    match pointer {
        None => Ok(output.clone()),
        Some(pointer) => output
            .pointer(pointer)
            .cloned()
            .ok_or_else(|| format!("pointer '{pointer}' not found in output of '{step}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_nested_placeholders() {
        let input = json!({
            "a": {"$from": "fetch", "pointer": "/body"},
            "list": [1, {"$memory": {"namespace": "notes", "key": "k1"}}],
            "plain": {"x": 1}
        });
        let refs: Vec<InputRef> = collect(&input).into_iter().map(Result::unwrap).collect();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&InputRef::From {
            step: "fetch".into(),
            pointer: Some("/body".into())
        }));
        assert!(refs.contains(&InputRef::Memory {
            namespace: Namespace::new_unchecked("notes"),
            key: MemoryKey::new_unchecked("k1"),
        }));
    }

    #[test]
    fn malformed_placeholders_are_reported() {
        let bad = [
            json!({"$from": 3}),
            json!({"$from": "a", "extra": true}),
            json!({"$from": "a", "pointer": "body"}),
            json!({"$memory": {"namespace": "n"}}),
            json!({"$memory": {"namespace": "bad ns", "key": "k"}}),
        ];
        for input in bad {
            let found = collect(&input);
            assert_eq!(found.len(), 1);
            assert!(found[0].is_err(), "{input} should be rejected");
        }
    }

    #[test]
    fn substitute_replaces_in_place() {
        let input = json!({"text": {"$from": "fetch", "pointer": "/title"}, "n": [1, 2]});
        let output = json!({"title": "hello"});
        let resolved = substitute(&input, &mut |r: &InputRef| match r {
            InputRef::From { step, pointer } => select(&output, step, pointer.as_deref()),
            InputRef::Memory { .. } => Err("unexpected".into()),
        })
        .unwrap();
        assert_eq!(resolved, json!({"text": "hello", "n": [1, 2]}));
    }

    #[test]
    fn missing_pointer_target_is_an_error() {
        let err = select(&json!({"a": 1}), "fetch", Some("/b")).unwrap_err();
        assert!(err.contains("/b"));
    }
}
