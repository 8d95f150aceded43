//! tilegrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TileGridConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub ingress: IngressConfig,
    pub log: LogConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of each stage scheduler's refresh/dispatch tick.
    pub stage_interval: String,
    /// Period of the hub's management tick.
    pub hub_interval: String,
    /// Upper bound on to-process entries pulled per fill step.
    pub dispatch_batch_size: usize,
    /// Upper bound on rows written by a single bulk mutation.
    pub write_chunk_size: usize,
    /// Fixed backoff before re-probing an unreachable worker.
    pub worker_retry: String,
    /// Timeout applied to each worker RPC.
    pub worker_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: Option<String>,
    pub json: bool,
}

/// A worker seeded into the store at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub local_work_capacity: f64,
    #[serde(default)]
    pub cluster_work_capacity: f64,
    #[serde(default)]
    pub is_cluster_proxy: bool,
    #[serde(default = "default_true")]
    pub is_in_scheduler_pool: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/tilegrid"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stage_interval: "30s".to_string(),
            hub_interval: "10s".to_string(),
            dispatch_batch_size: 50,
            write_chunk_size: 5000,
            worker_retry: "30s".to_string(),
            worker_timeout: "5s".to_string(),
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self { port: 6100 }
    }
}

impl SchedulerConfig {
    pub fn stage_interval(&self) -> Duration {
        parse_duration(&self.stage_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn hub_interval(&self) -> Duration {
        parse_duration(&self.hub_interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn worker_retry(&self) -> Duration {
        parse_duration(&self.worker_retry).unwrap_or(Duration::from_secs(30))
    }

    pub fn worker_timeout(&self) -> Duration {
        parse_duration(&self.worker_timeout).unwrap_or(Duration::from_secs(5))
    }

    /// Reject duration strings the getters could not parse.
    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("stage_interval", &self.stage_interval),
            ("hub_interval", &self.hub_interval),
            ("worker_retry", &self.worker_retry),
            ("worker_timeout", &self.worker_timeout),
        ];
        for (name, value) in durations {
            if parse_duration(value).is_none() {
                anyhow::bail!("scheduler.{name}: invalid duration {value:?}");
            }
        }
        Ok(())
    }
}

impl TileGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TileGridConfig = toml::from_str(&content)?;
        config.scheduler.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a duration string like "5s", "500ms", "1m", or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
