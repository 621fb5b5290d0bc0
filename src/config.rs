// src/config.rs

use std::path::{Path, PathBuf};
use std::{env, fmt};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Properties of the whole system: predefined defaults, overridable by an
/// optional `.env` properties file and then by environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyCenter {
    /// Broker bootstrap addresses (informational for the in-process broker).
    pub broker_addrs: String,
    /// Partition count newly registered channels default to.
    pub partitions: u32,
    /// Root of the part store the fan-in tracker scans.
    pub metadata_dir: PathBuf,
    /// Working/checkpoint directory for worker state and log files.
    pub checkpoint_dir: PathBuf,
    /// Print per-ack forwarding information.
    pub verbose: bool,
}

impl Default for PropertyCenter {
    fn default() -> Self {
        Self {
            broker_addrs: "localhost:9092".to_string(),
            partitions: 1,
            metadata_dir: PathBuf::from("metadata"),
            checkpoint_dir: PathBuf::from("checkpoint"),
            verbose: false,
        }
    }
}

impl PropertyCenter {
    /// Load properties: defaults, then the `.env` file if given (or the
    /// ambient one), then `WALKWAY_*` environment variables.
    pub fn load(env_file: Option<&Path>) -> Self {
        match env_file {
            Some(path) => {
                if dotenvy::from_path(path).is_ok() {
                    info!("loaded properties from {}", path.display());
                } else {
                    error!("could not load properties from {}", path.display());
                }
            }
            None => {
                dotenvy::dotenv().ok();
            }
        }

        let mut properties = Self::default();
        if let Ok(v) = env::var("WALKWAY_BROKERS") {
            properties.broker_addrs = v;
        }
        if let Ok(v) = env::var("WALKWAY_PARTITIONS") {
            match v.parse::<u32>() {
                Ok(n) if n > 0 => properties.partitions = n,
                _ => error!("ignoring invalid WALKWAY_PARTITIONS value `{v}`"),
            }
        }
        if let Ok(v) = env::var("WALKWAY_METADATA_DIR") {
            properties.metadata_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("WALKWAY_CHECKPOINT_DIR") {
            properties.checkpoint_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("WALKWAY_VERBOSE") {
            properties.verbose = matches!(v.as_str(), "1" | "true" | "yes");
        }
        properties
    }
}

impl fmt::Display for PropertyCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "brokers={} partitions={} metadata={} checkpoint={} verbose={}",
            self.broker_addrs,
            self.partitions,
            self.metadata_dir.display(),
            self.checkpoint_dir.display(),
            self.verbose
        )
    }
}
