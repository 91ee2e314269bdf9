use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How long a client waits for a correlated response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Daemon-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Transfer tool invoked for copy, move, push and pull.
    pub transfer_program: PathBuf,
    /// Time between the termination signal and the force-kill.
    #[serde(with = "humantime_duration")]
    pub abort_grace: Duration,
    /// Delay between dummy iterations.
    #[serde(with = "humantime_duration")]
    pub dummy_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            transfer_program: PathBuf::from("rsync"),
            abort_grace: Duration::from_secs(5),
            dummy_interval: Duration::from_secs(1),
        }
    }
}

impl DaemonConfig {
    /// Load a config from a JSON file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config = serde_json::from_reader(reader)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}
