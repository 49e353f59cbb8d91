//! botshard.toml configuration parser.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below. Durations are written as strings: `"500ms"`, `"5s"`,
//! `"10m"`, `"1h"`, or a bare number of seconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotshardConfig {
    pub fleet: FleetConfig,
    pub pools: PoolsConfig,
    pub assignment: AssignmentConfig,
    pub autoscale: AutoscaleConfig,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub injection: InjectionConfig,
    pub tracker: TrackerConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Regions served by this control plane. Each gets a default MAIN channel.
    pub regions: Vec<String>,
    /// Region used when a caller does not name one.
    pub default_region: String,
    /// Agent capacity of every newly created channel.
    pub channel_max_agents: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            regions: vec!["us".to_string()],
            default_region: "us".to_string(),
            channel_max_agents: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// Fixed shard capacity of a provisioned pool.
    pub shards_per_pool: u32,
    /// A pool at or above this fraction of used shards is considered full.
    pub fill_ratio: f64,
    /// Endpoint template; `{region}` and `{pool}` are substituted.
    pub endpoint_template: String,
    /// Provisioning refuses to create more pools than this per region.
    pub max_pools_per_region: u32,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            shards_per_pool: 334,
            fill_ratio: 0.9,
            endpoint_template: "127.0.0.1:7700".to_string(),
            max_pools_per_region: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub cache_ttl: String,
    /// Channels at or above this fraction of `max_agents` are not candidates.
    pub headroom_ratio: f64,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            cache_ttl: "30s".to_string(),
            headroom_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub interval: String,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_batch: u32,
    pub cooldown: String,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_batch: 10,
            cooldown: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: String,
    pub timeout: String,
    pub path: String,
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            timeout: "2s".to_string(),
            path: "/healthz".to_string(),
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    pub interval: String,
    pub max_batch_size: u32,
    /// An engine whose last progress is older than this gets kicked.
    pub stall_threshold: String,
    pub kick_duration: String,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            interval: "2s".to_string(),
            max_batch_size: 50,
            stall_threshold: "5s".to_string(),
            kick_duration: "2000ms".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub interval: String,
    pub stuck_timeout: String,
    pub max_retries: u32,
    pub cleanup_after_hours: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            stuck_timeout: "10m".to_string(),
            max_retries: 3,
            cleanup_after_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `memory` runs an in-process engine, `http` talks to a remote one.
    pub mode: String,
    pub endpoint: String,
    pub timeout: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: "memory".to_string(),
            endpoint: "127.0.0.1:7700".to_string(),
            timeout: "5s".to_string(),
        }
    }
}

impl BotshardConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: BotshardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the control loops cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fleet.regions.is_empty() {
            anyhow::bail!("fleet.regions must name at least one region");
        }
        if !self.fleet.regions.contains(&self.fleet.default_region) {
            anyhow::bail!(
                "fleet.default_region {:?} is not in fleet.regions",
                self.fleet.default_region
            );
        }
        if self.fleet.channel_max_agents == 0 {
            anyhow::bail!("fleet.channel_max_agents must be positive");
        }
        if self.pools.shards_per_pool == 0 {
            anyhow::bail!("pools.shards_per_pool must be positive");
        }
        if self.autoscale.scale_down_threshold >= self.autoscale.scale_up_threshold {
            anyhow::bail!("autoscale.scale_down_threshold must be below scale_up_threshold");
        }
        if self.injection.max_batch_size == 0 {
            anyhow::bail!("injection.max_batch_size must be positive");
        }
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "10m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Parse `s`, falling back to `default` when it is malformed.
pub fn duration_or(s: &str, default: Duration) -> Duration {
    parse_duration(s).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config = BotshardConfig::from_toml("").unwrap();
        assert_eq!(config.fleet.default_region, "us");
        assert_eq!(config.fleet.channel_max_agents, 30);
        assert_eq!(config.pools.shards_per_pool, 334);
        assert_eq!(config.autoscale.scale_up_batch, 10);
        assert_eq!(config.engine.mode, "memory");
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[fleet]
regions = ["us", "eu"]
default_region = "eu"

[autoscale]
cooldown = "2m"
"#;
        let config = BotshardConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.fleet.regions, vec!["us", "eu"]);
        assert_eq!(config.fleet.default_region, "eu");
        assert_eq!(config.autoscale.cooldown, "2m");
        assert_eq!(config.autoscale.scale_up_threshold, 0.8);
    }

    #[test]
    fn default_region_must_be_listed() {
        let toml_str = r#"
[fleet]
regions = ["eu"]
default_region = "us"
"#;
        assert!(BotshardConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let toml_str = r#"
[autoscale]
scale_up_threshold = 0.3
scale_down_threshold = 0.5
"#;
        assert!(BotshardConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = BotshardConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("shards_per_pool = 334"));
        assert!(BotshardConfig::from_toml(&text).is_ok());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn duration_or_falls_back() {
        assert_eq!(duration_or("bogus", Duration::from_secs(3)), Duration::from_secs(3));
        assert_eq!(duration_or("2s", Duration::from_secs(3)), Duration::from_secs(2));
    }
}
