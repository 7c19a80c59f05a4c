use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::DutyCycle;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub data_dir: PathBuf,

    // Monitored instances
    pub instance_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    pub status_port: u16,
    pub status_path: String,
    pub status_concurrency: usize,

    // Sampling
    pub capture_interface: String,
    pub capture_exclude: String,
    pub capture_secs: u64,
    pub idle_secs: u64,
    pub capture_grace_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<IpAddr>,

    // Geolocation
    pub geo_db_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_db_url: Option<String>,
    pub geo_refresh_secs: u64,
    pub geo_db_min_bytes: u64,
    pub geo_db_max_bytes: u64,
    pub geo_cache_limit: usize,

    // Maintenance
    pub backup_secs: u64,
    pub archive_keep: usize,
    pub history_secs: u64,
    pub history_retention_secs: u64,
    pub watchdog_secs: u64,
    pub idle_threshold_secs: u64,
    pub restart_cooldown_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_webhook: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/tallyd"),
            instance_prefix: "conduit".into(),
            primary_instance: None,
            network_name: None,
            status_port: 9090,
            status_path: "/status".into(),
            status_concurrency: 4,
            capture_interface: "any".into(),
            capture_exclude: "port 22".into(),
            capture_secs: 15,
            idle_secs: 15,
            capture_grace_secs: 5,
            local_ip: None,
            geo_db_path: PathBuf::from("/var/lib/tallyd/country.mmdb"),
            geo_db_url: None,
            // Weekly
            geo_refresh_secs: 7 * 24 * 3600,
            geo_db_min_bytes: 1024 * 1024,
            geo_db_max_bytes: 128 * 1024 * 1024,
            geo_cache_limit: 10_000,
            backup_secs: 3 * 3600,
            archive_keep: 3,
            history_secs: 300,
            history_retention_secs: 25 * 3600,
            watchdog_secs: 900,
            idle_threshold_secs: 7200,
            restart_cooldown_secs: 7200,
            alert_webhook: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("tallyd.toml"))
            .merge(Json::file("tallyd.json"))
            .merge(Env::prefixed("TALLYD_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.duty_cycle().is_none() {
            anyhow::bail!("capture_secs must be greater than zero");
        }
        if self.status_concurrency == 0 {
            anyhow::bail!("status_concurrency must be greater than zero");
        }
        if self.geo_db_min_bytes > self.geo_db_max_bytes {
            anyhow::bail!("geo_db_min_bytes exceeds geo_db_max_bytes");
        }
        Ok(())
    }

    /// `None` when `capture_secs` is zero.
    pub fn duty_cycle(&self) -> Option<DutyCycle> {
        DutyCycle::new(self.capture_secs, self.idle_secs)
    }

    pub fn capture_duration(&self) -> Duration {
        Duration::from_secs(self.capture_secs)
    }

    pub fn idle_duration(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}
