//! Configuration handling for the gateway.
//!
//! Settings come from the `plm:` section of a YAML file, then `PLM_*`
//! environment variables, then command line flags (applied in `main`).

use anyhow::{Context, Result};
use plm_session::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlmConfig {
    /// Connection manager settings
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Search candidate ports for a modem instead of using `address`
    pub discover: bool,
    /// Addresses offered to discovery
    pub candidates: Vec<String>,
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    plm: Option<PlmConfig>,
}

impl PlmConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok());

        info!(
            "Final configuration: address={}, discover={}, candidates={}, verify={}, \
             handshake={}ms x {}, watchdog={}ms",
            config.connection.address.as_deref().unwrap_or("-"),
            config.discover,
            config.candidates.len(),
            config.connection.verify_connection,
            config.connection.handshake_interval_ms,
            config.connection.max_handshake_attempts,
            config.connection.watchdog_delay_ms
        );

        Ok(config)
    }

    /// Read the `plm:` section of a YAML file; a missing file yields defaults
    pub fn load_from_file(config_path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(config_path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Config file {:?} not readable ({}), using defaults", config_path, e);
                return Ok(Self::default());
            }
        };

        let root: RootConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", config_path))?;
        info!("Loaded configuration from {:?}", config_path);

        Ok(root.plm.unwrap_or_default())
    }

    /// Apply `PLM_*` overrides looked up through `var`
    fn apply_environment_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(address) = var("PLM_ADDRESS") {
            info!("Address overridden by environment: {}", address);
            self.connection.address = Some(address);
        }

        if let Some(candidates) = var("PLM_CANDIDATES") {
            self.candidates = candidates
                .split(',')
                .map(str::trim)
                .filter(|candidate| !candidate.is_empty())
                .map(String::from)
                .collect();
            info!("Candidates overridden by environment: {:?}", self.candidates);
        }

        if let Some(discover) = var("PLM_DISCOVER") {
            self.discover = discover.eq_ignore_ascii_case("true");
        }

        if let Some(verify) = var("PLM_VERIFY_CONNECTION") {
            self.connection.verify_connection = verify.eq_ignore_ascii_case("true");
            info!(
                "Verification overridden by environment: {}",
                self.connection.verify_connection
            );
        }

        if let Some(baud) = var("PLM_BAUD_RATE") {
            match baud.parse::<u32>() {
                Ok(baud) => self.connection.baud_rate = baud,
                Err(_) => warn!("Ignoring PLM_BAUD_RATE={:?}", baud),
            }
        }

        if let Some(interval) = var("PLM_HANDSHAKE_INTERVAL_MS") {
            match interval.parse::<u64>() {
                Ok(ms) => self.connection.handshake_interval_ms = ms,
                Err(_) => warn!("Ignoring PLM_HANDSHAKE_INTERVAL_MS={:?}", interval),
            }
        }

        if let Some(attempts) = var("PLM_MAX_HANDSHAKE_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(n) => self.connection.max_handshake_attempts = n,
                Err(_) => warn!("Ignoring PLM_MAX_HANDSHAKE_ATTEMPTS={:?}", attempts),
            }
        }

        if let Some(delay) = var("PLM_WATCHDOG_DELAY_MS") {
            match delay.parse::<u64>() {
                Ok(ms) => self.connection.watchdog_delay_ms = ms,
                Err(_) => warn!("Ignoring PLM_WATCHDOG_DELAY_MS={:?}", delay),
            }
        }
    }
}
