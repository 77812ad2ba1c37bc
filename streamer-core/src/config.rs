use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ConfigError;

/// Flat option mapping handed down by the orchestrator.
pub type Options = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigDefault {
    Value(Value),
    /// The field has to be supplied by the orchestrator.
    NoDefault,
}

/// Configuration fields a stage accepts, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSchema {
    name: Option<String>,
    fields: Vec<(String, ConfigDefault)>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, default: impl Into<Value>) -> Self {
        self.fields
            .push((name.to_string(), ConfigDefault::Value(default.into())));
        self
    }

    pub fn required(mut self, name: &str) -> Self {
        self.fields.push((name.to_string(), ConfigDefault::NoDefault));
        self
    }

    /// Namespaces every field as `name.field` when looked up in the options.
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn only_with_defaults(mut self) -> Self {
        self.fields
            .retain(|(_, default)| !matches!(default, ConfigDefault::NoDefault));
        self
    }

    pub fn without(mut self, names: &[&str]) -> Self {
        self.fields
            .retain(|(field, _)| !names.contains(&field.as_str()));
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Option keys with their defaults, namespace applied.
    pub fn fields(&self) -> impl Iterator<Item = (String, &ConfigDefault)> {
        self.fields
            .iter()
            .map(|(field, default)| (self.key(field), default))
    }

    /// The fields that carry a default, keyed the way options are.
    pub fn defaults(&self) -> Options {
        self.fields()
            .filter_map(|(key, default)| match default {
                ConfigDefault::Value(value) => Some((key, value.clone())),
                ConfigDefault::NoDefault => None,
            })
            .collect()
    }

    /// Overlays `options` on the defaults. Fails when a field without a
    /// default is not supplied.
    pub fn resolve(&self, options: &Options) -> Result<StageConfig, ConfigError> {
        let mut values = Options::new();
        for (field, default) in &self.fields {
            let key = self.key(field);
            let value = match (options.get(&key), default) {
                (Some(value), _) => value.clone(),
                (None, ConfigDefault::Value(value)) => value.clone(),
                (None, ConfigDefault::NoDefault) => return Err(ConfigError::Missing(key)),
            };
            values.insert(field.clone(), value);
        }

        Ok(StageConfig {
            name: self.name.clone(),
            values,
        })
    }

    fn key(&self, field: &str) -> String {
        match &self.name {
            Some(name) => format!("{}.{}", name, field),
            None => field.to_string(),
        }
    }
}

/// Effective configuration of one stage: schema defaults overridden by options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageConfig {
    name: Option<String>,
    values: Options,
}

impl StageConfig {
    pub fn get<T: DeserializeOwned>(&self, field: &str) -> Result<T, ConfigError> {
        let value = self
            .values
            .get(field)
            .ok_or_else(|| ConfigError::Missing(self.key(field)))?;
        T::deserialize(value).map_err(|source| ConfigError::Invalid {
            field: self.key(field),
            source,
        })
    }

    pub fn raw(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Deserializes every resolved field at once, e.g. into a settings struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(Value::Object(self.values.clone())).map_err(|source| {
            ConfigError::Invalid {
                field: self.name.clone().unwrap_or_default(),
                source,
            }
        })
    }

    fn key(&self, field: &str) -> String {
        match &self.name {
            Some(name) => format!("{}.{}", name, field),
            None => field.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
