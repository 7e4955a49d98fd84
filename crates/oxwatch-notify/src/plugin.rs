use crate::error::{NotifyError, Result};
use crate::NotificationChannel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Receiver name → configured channel instance.
pub type ChannelMap = HashMap<String, Arc<dyn NotificationChannel>>;

/// A receiver as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default = "empty_config")]
    pub config: Value,
}

fn empty_config() -> Value {
    Value::Object(Default::default())
}

/// Factory for creating [`NotificationChannel`] instances from JSON
/// configuration.
///
/// Each plugin is registered in the [`ChannelRegistry`] by its `name()`.
/// When a configuration snapshot is built, the registry validates and
/// instantiates every receiver through the matching plugin.
pub trait ChannelPlugin: Send + Sync {
    /// Returns the plugin type name (e.g., `"webhook"`, `"log"`).
    fn name(&self) -> &str;

    /// Validates a JSON config blob against this plugin's expected schema.
    fn validate_config(&self, config: &Value) -> anyhow::Result<()>;

    /// Creates a configured channel instance. `receiver` is the receiver
    /// name the instance serves.
    fn create_channel(&self, receiver: &str, config: &Value) -> anyhow::Result<Arc<dyn NotificationChannel>>;

    /// Returns a copy of `config` with secrets redacted. Used for API
    /// responses.
    fn redact_config(&self, config: &Value) -> Value {
        config.clone()
    }
}

/// Registry of available [`ChannelPlugin`]s, used to instantiate
/// notification channels from configuration.
///
/// # Examples
///
/// ```
/// use oxwatch_notify::plugin::ChannelRegistry;
///
/// let registry = ChannelRegistry::default();
/// assert!(registry.has_plugin("webhook"));
/// assert!(registry.has_plugin("log"));
/// assert!(!registry.has_plugin("nonexistent"));
/// ```
pub struct ChannelRegistry {
    plugins: HashMap<String, Box<dyn ChannelPlugin>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn ChannelPlugin>) {
        let name = plugin.name().to_string();
        self.plugins.insert(name, plugin);
    }

    pub fn create_channel(&self, receiver: &ReceiverConfig) -> Result<Arc<dyn NotificationChannel>> {
        let plugin = self
            .plugins
            .get(&receiver.channel_type)
            .ok_or_else(|| NotifyError::UnknownChannelType(receiver.channel_type.clone()))?;
        let invalid = |e: anyhow::Error| NotifyError::InvalidConfig {
            receiver: receiver.name.clone(),
            reason: e.to_string(),
        };
        plugin.validate_config(&receiver.config).map_err(invalid)?;
        plugin
            .create_channel(&receiver.name, &receiver.config)
            .map_err(invalid)
    }

    /// Instantiates every receiver. Names must be unique.
    pub fn build(&self, receivers: &[ReceiverConfig]) -> Result<ChannelMap> {
        let mut channels = ChannelMap::new();
        for receiver in receivers {
            if channels.contains_key(&receiver.name) {
                return Err(NotifyError::DuplicateReceiver(receiver.name.clone()));
            }
            let channel = self.create_channel(receiver)?;
            channels.insert(receiver.name.clone(), channel);
        }
        Ok(channels)
    }

    /// The receiver's config with secrets redacted by its plugin.
    pub fn redacted(&self, receiver: &ReceiverConfig) -> Value {
        match self.plugins.get(&receiver.channel_type) {
            Some(plugin) => plugin.redact_config(&receiver.config),
            None => receiver.config.clone(),
        }
    }

    pub fn has_plugin(&self, type_name: &str) -> bool {
        self.plugins.contains_key(type_name)
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::channels::webhook::WebhookPlugin));
        registry.register(Box::new(crate::channels::log::LogPlugin));
        registry
    }
}
