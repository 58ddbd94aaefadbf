use crate::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Flat key -> value view of a run's context.
pub type ContextMap = BTreeMap<String, Value>;

/// Prefix of keys the runtime owns. These never reach LLM preambles and are
/// dropped by the `compact` fidelity mode.
pub const INTERNAL_PREFIX: &str = "internal.";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub values: ContextMap,
    pub logs: Vec<String>,
}

/// Keyed in-memory store backing one run (or one parallel branch).
///
/// Values are shallow-copied on snapshot and treated as immutable by
/// convention; concurrent branches must work on `clone_detached()` copies,
/// never on the parent store.
#[derive(Clone, Debug, Default)]
pub struct Context {
    inner: Arc<RwLock<ContextSnapshot>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(values: ContextMap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ContextSnapshot {
                values,
                logs: Vec::new(),
            })),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, ContextSnapshot>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Runtime("context read lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, ContextSnapshot>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Runtime("context write lock poisoned".to_string()))
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.read()?.values.get(key).cloned())
    }

    /// Missing or non-string keys read as the empty string.
    pub fn get_str(&self, key: &str) -> Result<String, EngineError> {
        Ok(self
            .get(key)?
            .map(|value| match value {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .unwrap_or_default())
    }

    /// Missing or non-numeric keys read as zero.
    pub fn get_i64(&self, key: &str) -> Result<i64, EngineError> {
        Ok(self
            .get(key)?
            .and_then(|value| match value {
                Value::Number(number) => number.as_i64(),
                Value::String(text) => text.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(0))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, EngineError> {
        Ok(self
            .get(key)?
            .and_then(|value| value.as_bool())
            .unwrap_or(false))
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), EngineError> {
        let key = key.into();
        validate_key(&key)?;
        self.write()?.values.insert(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), EngineError> {
        self.write()?.values.remove(key);
        Ok(())
    }

    pub fn apply_updates(&self, updates: &ContextMap) -> Result<(), EngineError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut state = self.write()?;
        for (key, value) in updates {
            validate_key(key)?;
            state.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn append_log(&self, line: impl Into<String>) -> Result<(), EngineError> {
        self.write()?.logs.push(line.into());
        Ok(())
    }

    pub fn logs(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.read()?.logs.clone())
    }

    pub fn snapshot(&self) -> Result<ContextSnapshot, EngineError> {
        Ok(self.read()?.clone())
    }

    /// Independent copy of both the map and the log sequence. The copy and
    /// the original never observe each other's later writes.
    pub fn clone_detached(&self) -> Result<Self, EngineError> {
        let snapshot = self.snapshot()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(snapshot)),
        })
    }

    /// Keys matching `prefix`, in map order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .read()?
            .values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

const MAX_KEY_LENGTH: usize = 256;

pub fn validate_key(key: &str) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(EngineError::Runtime(
            "context key cannot be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(EngineError::Runtime(format!(
            "context key '{key}' exceeds max length {MAX_KEY_LENGTH}"
        )));
    }
    for segment in key.split('.') {
        let mut chars = segment.chars();
        let ok = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
            }
            None => false,
        };
        if !ok {
            return Err(EngineError::Runtime(format!(
                "context key '{key}' has invalid segment '{segment}'"
            )));
        }
    }
    Ok(())
}
