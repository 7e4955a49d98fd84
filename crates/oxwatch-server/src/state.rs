use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::snapshot::{ConfigError, ConfigSnapshot};
use chrono::{DateTime, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use oxwatch_notify::plugin::ChannelRegistry;
use oxwatch_notify::silence::SilenceStore;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub silences: Arc<SilenceStore>,
    pub registry: Arc<ChannelRegistry>,
    /// File re-read on reload. `None` disables reloading.
    pub config_path: Option<Arc<String>>,
    pub metrics: Option<PrometheusHandle>,
    pub start_time: DateTime<Utc>,
    /// Serializes reloads so snapshot versions stay monotonic.
    pub reload_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, silences: Arc<SilenceStore>, registry: Arc<ChannelRegistry>) -> Self {
        Self {
            engine,
            silences,
            registry,
            config_path: None,
            metrics: None,
            start_time: Utc::now(),
            reload_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_config_path(mut self, path: &str) -> Self {
        self.config_path = Some(Arc::new(path.to_string()));
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Re-reads the config file and activates it as a new snapshot. On any
    /// error the active snapshot is left untouched. Returns the new version.
    pub async fn reload(&self) -> Result<u64, ConfigError> {
        let Some(path) = self.config_path.as_deref() else {
            return Err(ConfigError::ReloadUnavailable);
        };
        let _guard = self.reload_lock.lock().await;
        let version = self.engine.snapshot().version + 1;

        let built = ServerConfig::load(path).and_then(|config| ConfigSnapshot::build(&config, &self.registry, version));
        match built {
            Ok(snapshot) => {
                self.engine.reload(snapshot, Utc::now()).await;
                counter!("oxwatch_config_reloads_total", "result" => "success").increment(1);
                Ok(version)
            }
            Err(e) => {
                counter!("oxwatch_config_reloads_total", "result" => "rejected").increment(1);
                tracing::error!(
                    path = %path,
                    error = %e,
                    active_version = self.engine.snapshot().version,
                    "Configuration rejected, keeping the active snapshot"
                );
                Err(e)
            }
        }
    }
}
