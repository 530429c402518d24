//! Per-step, per-run state
//!
//! A [`StateBag`] remembers what a step did during the current invocation.
//! It is never persisted; a fresh bag is installed at the start of every
//! execution.

use crate::report::Metadata;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A value stored in a [`StateBag`]
#[derive(Clone)]
pub enum StateValue {
    Bool(bool),
    Text(String),
    List(Vec<String>),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            StateValue::Text(s) => f.debug_tuple("Text").field(s).finish(),
            StateValue::List(l) => f.debug_tuple("List").field(l).finish(),
            StateValue::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::Text(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::Text(value.to_string())
    }
}

impl From<Vec<String>> for StateValue {
    fn from(value: Vec<String>) -> Self {
        StateValue::List(value)
    }
}

/// Key/value memory owned by exactly one step
#[derive(Debug, Clone, Default)]
pub struct StateBag {
    values: BTreeMap<String, StateValue>,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Store an opaque value
    pub fn set_opaque<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values
            .insert(key.into(), StateValue::Opaque(Arc::new(value)));
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key)
    }

    /// Boolean flag; absent or non-boolean values read as false
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(StateValue::Bool(true)))
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(StateValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// String list; absent or non-list values read as empty
    pub fn list(&self, key: &str) -> &[String] {
        match self.values.get(key) {
            Some(StateValue::List(l)) => l,
            _ => &[],
        }
    }

    /// Append to a string list, creating it if needed
    pub fn push(&mut self, key: &str, item: impl Into<String>) {
        match self.values.get_mut(key) {
            Some(StateValue::List(l)) => l.push(item.into()),
            _ => {
                self.values
                    .insert(key.to_string(), StateValue::List(vec![item.into()]));
            }
        }
    }

    pub fn opaque<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.values.get(key) {
            Some(StateValue::Opaque(v)) => v.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Render the bag as report metadata
    ///
    /// Booleans become `"true"`/`"false"`, lists are comma-joined, opaque
    /// values are omitted.
    pub fn to_metadata(&self) -> Metadata {
        self.values
            .iter()
            .filter_map(|(k, v)| {
                let rendered = match v {
                    StateValue::Bool(b) => b.to_string(),
                    StateValue::Text(s) => s.clone(),
                    StateValue::List(l) => l.join(","),
                    StateValue::Opaque(_) => return None,
                };
                Some((k.clone(), rendered))
            })
            .collect()
    }
}
