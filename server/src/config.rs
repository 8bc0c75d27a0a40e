use anyhow::{Context, anyhow};
use serde::Deserialize;
use std::{net::SocketAddr, path::Path, rc::Rc};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

/// Clustering density, room lifetimes and paging limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Grid cells per map tile edge; higher means smaller clusters
    pub cells_per_tile: u32,
    /// Lifetime of rooms created without an explicit TTL
    pub default_ttl_minutes: u32,
    /// How long closed and expired rooms stay queryable before being dropped
    pub retention_minutes: i64,
    pub max_page_size: u32,
    pub cleanup_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cells_per_tile: 4,
            default_ttl_minutes: 60,
            retention_minutes: 60,
            max_page_size: 100,
            cleanup_interval_secs: 60,
        }
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
