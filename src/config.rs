//! # Pipeline Configuration
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults ([`PipelineConfig::default`])
//! 2. `pipeline.toml` in the working directory, if present
//! 3. Environment variables prefixed `PIPELINE__`, e.g.
//!    `PIPELINE__ASSEMBLY_WORK_MS=250`
//!
//! The loaded config is validated once and read-only after that; every stage
//! gets what it needs copied out of it at startup.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use stage_framework::{StageOptions, MAX_CONCURRENT_CALLS};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "pipeline.toml";
pub const CONFIG_ENV_PREFIX: &str = "PIPELINE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Broker to connect to. Only `memory://<name>` is supported.
    pub connection_string: String,
    pub assembly_queue: String,
    pub shipping_queue: String,
    pub assembly_work_ms: u64,
    pub shipping_work_min_ms: u64,
    /// Exclusive upper bound.
    pub shipping_work_max_ms: u64,
    pub max_lock_renewal_secs: u64,
    pub max_concurrent_calls: usize,
    pub receive_wait_ms: u64,
    pub transport_retry_ms: u64,
    /// Seed for every random source in the pipeline; unset means entropy.
    pub rng_seed: Option<u64>,
    /// Orders the demo binary submits on startup.
    pub demo_orders: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            connection_string: "memory://crazybike".to_string(),
            assembly_queue: "crazybike-assembler".to_string(),
            shipping_queue: "crazybike-shipper".to_string(),
            assembly_work_ms: 5_000,
            shipping_work_min_ms: 1_000,
            shipping_work_max_ms: 5_000,
            max_lock_renewal_secs: 60 * 60,
            max_concurrent_calls: MAX_CONCURRENT_CALLS,
            receive_wait_ms: 1_000,
            transport_retry_ms: 500,
            rng_seed: None,
            demo_orders: 3,
        }
    }
}

impl PipelineConfig {
    /// Loads from `pipeline.toml` (optional) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Loads from the given TOML file (optional) and the environment.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        use ::config::{Config, Environment, File, FileFormat};

        let config = Config::builder()
            .add_source(File::new(&path.to_string_lossy(), FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: PipelineConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.assembly_queue.trim().is_empty() || self.shipping_queue.trim().is_empty() {
            return Err(ConfigError::Invalid("queue names must not be empty".into()));
        }
        if self.assembly_queue == self.shipping_queue {
            return Err(ConfigError::Invalid(format!(
                "assembly and shipping share queue '{}'",
                self.assembly_queue
            )));
        }
        if self.shipping_work_min_ms >= self.shipping_work_max_ms {
            return Err(ConfigError::Invalid(format!(
                "shipping work range {}..{} ms is empty",
                self.shipping_work_min_ms, self.shipping_work_max_ms
            )));
        }
        if self.receive_wait_ms == 0 || self.transport_retry_ms == 0 {
            return Err(ConfigError::Invalid(
                "receive_wait_ms and transport_retry_ms must be positive".into(),
            ));
        }
        if self.max_concurrent_calls != MAX_CONCURRENT_CALLS {
            return Err(ConfigError::Invalid(format!(
                "max_concurrent_calls must be {}, got {}",
                MAX_CONCURRENT_CALLS, self.max_concurrent_calls
            )));
        }
        Ok(())
    }

    pub fn assembly_work(&self) -> Duration {
        Duration::from_millis(self.assembly_work_ms)
    }

    pub fn shipping_work_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.shipping_work_min_ms),
            Duration::from_millis(self.shipping_work_max_ms),
        )
    }

    /// Engine options shared by every stage of this pipeline.
    pub fn stage_options(&self, name: &str, inbound_queue: &str) -> StageOptions {
        StageOptions::new(name, inbound_queue)
            .with_max_lock_renewal(Duration::from_secs(self.max_lock_renewal_secs))
            .with_receive_wait(Duration::from_millis(self.receive_wait_ms))
            .with_transport_retry_delay(Duration::from_millis(self.transport_retry_ms))
    }

    /// Random source for one component. Each `stream` gets its own sequence
    /// so seeded runs are reproducible per component.
    pub fn rng(&self, stream: u64) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_entropy(),
        }
    }
}
