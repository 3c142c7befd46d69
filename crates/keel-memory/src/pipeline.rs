//! Transformation stages run around every store access.
//!
//! `before_save` stages run in registration order on each `put` and may
//! reject the value. `after_load` stages run on each value returned by `get`
//! or `scan` and cannot fail.

use keel_core::{MemoryError, MemoryKey, MemoryResult, MemoryValue, Namespace};
use std::fmt;
use std::sync::Arc;

type SaveFn =
    dyn Fn(&Namespace, &MemoryKey, MemoryValue) -> Result<MemoryValue, String> + Send + Sync;
type LoadFn = dyn Fn(&Namespace, &MemoryKey, MemoryValue) -> MemoryValue + Send + Sync;

#[derive(Clone, Default)]
pub struct MemoryPipeline {
    before_save: Vec<(String, Arc<SaveFn>)>,
    after_load: Vec<(String, Arc<LoadFn>)>,
}

impl MemoryPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage run before a value is stored.
    pub fn before_save<F>(mut self, name: impl Into<String>, stage: F) -> Self
    where
        F: Fn(&Namespace, &MemoryKey, MemoryValue) -> Result<MemoryValue, String>
            + Send
            + Sync
            + 'static,
    {
        self.before_save.push((name.into(), Arc::new(stage)));
        self
    }

    /// Append a stage run after a value is read.
    pub fn after_load<F>(mut self, name: impl Into<String>, stage: F) -> Self
    where
        F: Fn(&Namespace, &MemoryKey, MemoryValue) -> MemoryValue + Send + Sync + 'static,
    {
        self.after_load.push((name.into(), Arc::new(stage)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.before_save.is_empty() && self.after_load.is_empty()
    }

    pub fn apply_before_save(
        &self,
        namespace: &Namespace,
        key: &MemoryKey,
        mut value: MemoryValue,
    ) -> MemoryResult<MemoryValue> {
        for (name, stage) in &self.before_save {
            value = stage(namespace, key, value).map_err(|reason| MemoryError::Pipeline {
                stage: name.clone(),
                reason,
            })?;
        }
        Ok(value)
    }

    pub fn apply_after_load(
        &self,
        namespace: &Namespace,
        key: &MemoryKey,
        mut value: MemoryValue,
    ) -> MemoryValue {
        for (_, stage) in &self.after_load {
            value = stage(namespace, key, value);
        }
        value
    }
}

impl fmt::Debug for MemoryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPipeline")
            .field("before_save", &stage_names(&self.before_save))
            .field("after_load", &stage_names(&self.after_load))
            .finish()
    }
}

fn stage_names<T>(stages: &[(String, T)]) -> Vec<&str> {
    stages.iter().map(|(name, _)| name.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> (Namespace, MemoryKey) {
        (
            Namespace::parse("results").unwrap(),
            MemoryKey::parse("k").unwrap(),
        )
    }

    #[test]
    fn stages_run_in_order() {
        let (ns, key) = ids();
        let pipeline = MemoryPipeline::new()
            .before_save("wrap", |_, _, v| Ok(MemoryValue::Json(json!({"v": v.to_json()}))))
            .before_save("tag", |ns, _, v| {
                let mut json = v.to_json();
                json["ns"] = json!(ns.as_str());
                Ok(MemoryValue::Json(json))
            });

        let out = pipeline
            .apply_before_save(&ns, &key, MemoryValue::Json(json!(1)))
            .unwrap();
        assert_eq!(out, MemoryValue::Json(json!({"v": 1, "ns": "results"})));
    }

    #[test]
    fn rejecting_stage_is_named_in_error() {
        let (ns, key) = ids();
        let pipeline = MemoryPipeline::new()
            .before_save("no-bytes", |_, _, v| match v {
                MemoryValue::Bytes(_) => Err("bytes not allowed".into()),
                other => Ok(other),
            });

        let err = pipeline
            .apply_before_save(&ns, &key, MemoryValue::Bytes(vec![1]))
            .unwrap_err();
        assert_eq!(
            err,
            MemoryError::Pipeline {
                stage: "no-bytes".into(),
                reason: "bytes not allowed".into()
            }
        );
    }

    #[test]
    fn after_load_transforms_value() {
        let (ns, key) = ids();
        let pipeline = MemoryPipeline::new().after_load("unwrap", |_, _, v| match v.to_json() {
            serde_json::Value::Object(mut map) => {
                MemoryValue::Json(map.remove("v").unwrap_or_default())
            }
            other => MemoryValue::Json(other),
        });
        let out = pipeline.apply_after_load(&ns, &key, MemoryValue::Json(json!({"v": "x"})));
        assert_eq!(out, MemoryValue::Json(json!("x")));
        assert!(!pipeline.is_empty());
    }
}
