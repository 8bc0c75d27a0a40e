use anyhow::{Context, anyhow};
use roomscope_shared::{Bounds, UserId};
use serde::Deserialize;
use std::{path::Path, rc::Rc, time::Duration};

use crate::geo::DEFAULT_EXPAND_FACTOR;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_events_url")]
    pub events_url: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Viewport the watcher starts with
    pub initial_bounds: Bounds,
    #[serde(default = "default_initial_zoom")]
    pub initial_zoom: f64,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_api_base() -> String {
    "http://127.0.0.1:3000/api".to_string()
}

fn default_events_url() -> String {
    "ws://127.0.0.1:3000/api/events".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_initial_zoom() -> f64 {
    12.0
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Timings and sizes of the discovery engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Debounce for zoom <= 5
    pub debounce_low_zoom_ms: u64,
    /// Debounce for zoom <= 12
    pub debounce_mid_zoom_ms: u64,
    /// Debounce above zoom 12
    pub debounce_high_zoom_ms: u64,
    pub hidden_ttl_secs: u64,
    pub pending_ttl_secs: u64,
    pub refetch_delay_ms: u64,
    pub expand_factor: f64,
    pub prefetch_padding: f64,
    pub page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_low_zoom_ms: 200,
            debounce_mid_zoom_ms: 150,
            debounce_high_zoom_ms: 100,
            hidden_ttl_secs: 5 * 60,
            pending_ttl_secs: 30,
            refetch_delay_ms: 500,
            expand_factor: DEFAULT_EXPAND_FACTOR,
            prefetch_padding: 1.5,
            page_size: 20,
        }
    }
}

impl EngineConfig {
    pub fn hidden_ttl(&self) -> Duration {
        Duration::from_secs(self.hidden_ttl_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn refetch_delay(&self) -> Duration {
        Duration::from_millis(self.refetch_delay_ms)
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        tvix_serde::from_str_with_config(&content, |eval| {
            eval.enable_import().io_handle(Rc::new(tvix_eval::StdIO))
        })
        .map_err(|e| anyhow!("failed to parse config: {e}"))
    }
}
