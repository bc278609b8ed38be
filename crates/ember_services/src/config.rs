//! Configuration service
//!
//! Environment-layered JSON settings. Values live in a `default` layer plus
//! one overlay per environment; lookups resolve against the active
//! environment first and fall back to `default`, deep-merging objects so a
//! partial overlay only replaces the keys it names.
//!
//! Keys are dotted paths into nested objects: `assets.memoryBudgetBytes`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::{CoreEvent, ServiceBus};
use crate::service::{Service, ServiceError, ServiceResult};

/// Layer every environment falls back to
pub const BASE_ENVIRONMENT: &str = "default";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed configuration for environment '{environment}': {source}")]
    Parse {
        environment: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration for environment '{environment}' must be a JSON object")]
    NotAnObject { environment: String },

    #[error("Missing configuration key: {0}")]
    Missing(String),

    #[error("Configuration key '{key}' has an unexpected type: {source}")]
    Type {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Environment-layered settings store
pub struct ConfigurationService {
    environment: String,
    layers: RwLock<HashMap<String, Map<String, Value>>>,
    sources: Vec<(String, PathBuf)>,
    bus: Option<ServiceBus>,
}

impl ConfigurationService {
    /// Create an empty store with `environment` active
    pub fn new(environment: impl Into<String>) -> Self {
        let mut layers = HashMap::new();
        layers.insert(BASE_ENVIRONMENT.to_string(), Map::new());
        Self {
            environment: environment.into(),
            layers: RwLock::new(layers),
            sources: Vec::new(),
            bus: None,
        }
    }

    /// Publish `config:changed` on this bus
    pub fn with_bus(mut self, bus: ServiceBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Load `path` into `environment` during `init`
    pub fn with_source(mut self, environment: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.sources.push((environment.into(), path.into()));
        self
    }

    /// Active environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Environments with a layer
    pub fn environments(&self) -> Vec<String> {
        let mut envs: Vec<String> = self.layers.read().keys().cloned().collect();
        envs.sort();
        envs
    }

    /// Merge a JSON object into an environment's layer
    pub fn load_str(&self, environment: &str, json: &str) -> ConfigResult<()> {
        let value: Value = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            environment: environment.to_string(),
            source,
        })?;
        let Value::Object(incoming) = value else {
            return Err(ConfigError::NotAnObject {
                environment: environment.to_string(),
            });
        };

        let mut layers = self.layers.write();
        let layer = layers.entry(environment.to_string()).or_default();
        for (key, value) in incoming {
            let merged = match layer.remove(&key) {
                Some(existing) => merge(&existing, &value),
                None => value,
            };
            layer.insert(key, merged);
        }
        log::debug!("Loaded configuration layer '{}'", environment);
        Ok(())
    }

    /// Merge a JSON file into an environment's layer
    pub fn load_file(&self, environment: &str, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_str(environment, &text)
    }

    /// Write an environment's layer as pretty JSON
    pub fn save_file(&self, environment: &str, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let layer = self.layers.read().get(environment).cloned().unwrap_or_default();
        let text = serde_json::to_string_pretty(&Value::Object(layer)).map_err(|source| {
            ConfigError::Parse {
                environment: environment.to_string(),
                source,
            }
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolved raw value
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let layers = self.layers.read();
        let base = layers.get(BASE_ENVIRONMENT).and_then(|layer| lookup(layer, key));
        let overlay = if self.environment == BASE_ENVIRONMENT {
            None
        } else {
            layers.get(&self.environment).and_then(|layer| lookup(layer, key))
        };

        match (base, overlay) {
            (Some(base), Some(overlay)) => Some(merge(base, overlay)),
            (None, Some(value)) | (Some(value), None) => Some(value.clone()),
            (None, None) => None,
        }
    }

    /// Typed value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> ConfigResult<T> {
        let value = self
            .get_value(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))?;
        serde_json::from_value(value).map_err(|source| ConfigError::Type {
            key: key.to_string(),
            source,
        })
    }

    /// Typed value, or `default` when the key is absent
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> ConfigResult<T> {
        match self.get(key) {
            Err(ConfigError::Missing(_)) => Ok(default),
            other => other,
        }
    }

    /// Check whether a key resolves
    pub fn has(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    /// Set a value in the active environment's layer
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> ConfigResult<()> {
        let value = serde_json::to_value(value).map_err(|source| ConfigError::Type {
            key: key.to_string(),
            source,
        })?;

        {
            let mut layers = self.layers.write();
            let layer = layers.entry(self.environment.clone()).or_default();
            insert(layer, key, value);
        }

        self.notify(key);
        Ok(())
    }

    /// Remove a key from the active environment's layer
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut layers = self.layers.write();
            layers
                .get_mut(&self.environment)
                .map(|layer| remove(layer, key))
                .unwrap_or(false)
        };
        if removed {
            self.notify(key);
        }
        removed
    }

    fn notify(&self, key: &str) {
        log::trace!("Configuration '{}' changed in '{}'", key, self.environment);
        if let Some(bus) = &self.bus {
            bus.publish(CoreEvent::ConfigChanged {
                environment: self.environment.clone(),
                key: key.to_string(),
            });
        }
    }
}

fn lookup<'a>(layer: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let mut current = layer.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn insert(layer: &mut Map<String, Value>, key: &str, value: Value) {
    let mut segments: Vec<&str> = key.split('.').collect();
    let Some(last) = segments.pop() else { return };

    let mut current = layer;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else { return };
        current = next;
    }
    current.insert(last.to_string(), value);
}

fn remove(layer: &mut Map<String, Value>, key: &str) -> bool {
    match key.split_once('.') {
        None => layer.remove(key).is_some(),
        Some((head, rest)) => match layer.get_mut(head) {
            Some(Value::Object(child)) => remove(child, rest),
            _ => false,
        },
    }
}

fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let value = match merged.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

#[async_trait]
impl Service for ConfigurationService {
    async fn init(&self) -> ServiceResult<()> {
        for (environment, path) in &self.sources {
            self.load_file(environment, path)
                .map_err(|e| ServiceError::operation(e.to_string()))?;
        }
        log::info!(
            "Configuration ready (environment '{}', {} source(s))",
            self.environment,
            self.sources.len()
        );
        Ok(())
    }
}
