use std::{collections::BTreeMap, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StateError;

/// Immutable per-item metadata carried alongside data through a pipeline.
///
/// Fields are fixed when a state is built; [`State::mutate`] hands back a new
/// state and leaves the receiver untouched. There is no `&mut self` API, so
/// every in-place mutation is rejected by the compiler:
///
/// ```compile_fail
/// use streamer_core::state::State;
/// let mut state = State::new([("hello", "World")]);
/// state["new"] = serde_json::json!("hello");
/// ```
///
/// ```compile_fail
/// use streamer_core::state::State;
/// let mut state = State::new([("hello", "World")]);
/// state.remove("hello");
/// ```
///
/// ```compile_fail
/// use streamer_core::state::State;
/// let mut state = State::new([("hello", "World")]);
/// state.extend([("new", "hello")]);
/// ```
///
/// ```compile_fail
/// use streamer_core::state::State;
/// let mut state = State::new([("hello", "World")]);
/// state.pop_first();
/// ```
///
/// ```compile_fail
/// use streamer_core::state::State;
/// let state = State::new([("hello", "World")]);
/// let fields: &mut std::collections::BTreeMap<String, serde_json::Value> = &mut state.fields;
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    fields: Arc<BTreeMap<String, Value>>,
}

impl State {
    pub fn new<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            fields: Arc::new(
                fields
                    .into_iter()
                    .map(|(key, value)| (key.into(), value.into()))
                    .collect(),
            ),
        }
    }

    /// Returns a copy of this state with `fields` merged over it.
    pub fn mutate<I, K, V>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut merged = (*self.fields).clone();
        merged.extend(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value.into())),
        );
        Self {
            fields: Arc::new(merged),
        }
    }

    pub fn get(&self, field: &str) -> Result<&Value, StateError> {
        self.fields
            .get(field)
            .ok_or_else(|| StateError::MissingField(field.to_string()))
    }

    /// Reads `field` and deserializes it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Result<T, StateError> {
        let value = self.get(field)?;
        T::deserialize(value).map_err(|source| StateError::InvalidField {
            field: field.to_string(),
            source,
        })
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// True when both handles share the same underlying fields.
    pub fn same_instance(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;
