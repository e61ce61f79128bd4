use crate::core::get_config_dir;
use crate::core::metrics::{DEFAULT_ENDPOINT, DEFAULT_QUERY_TIMEOUT};
use crate::core::scheduler::{
    DEFAULT_BASE_PORT, DEFAULT_INTERVAL, DEFAULT_MAX_WORKERS, DEFAULT_NUM_PARALLEL,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    /// Folder of numbered job configs. Usually given on the command line.
    #[serde(default)]
    pub catalog_dir: Option<PathBuf>,
    #[serde(default = "default_num_parallel")]
    pub num_parallel: usize,
    /// Budget of concurrently held resource units (parallel environments)
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Where sanitized configs are written (default: runtime dir)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct TrainerConfig {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    /// Flag that carries the first reserved port, passed as `<flag>=<port>`
    #[serde(default = "default_port_flag")]
    pub port_flag: String,
    /// Extra arguments placed before the config path
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// Set to false to ignore stop conditions entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl MetricsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_num_parallel() -> usize {
    DEFAULT_NUM_PARALLEL
}

fn default_max_workers() -> u32 {
    DEFAULT_MAX_WORKERS
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL.as_secs()
}

fn default_program() -> PathBuf {
    PathBuf::from("mlagents-learn")
}

fn default_port_flag() -> String {
    "--base-port".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT.as_secs()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            catalog_dir: None,
            num_parallel: default_num_parallel(),
            max_workers: default_max_workers(),
            base_port: default_base_port(),
            interval_secs: default_interval_secs(),
            staging_dir: None,
        }
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            port_flag: default_port_flag(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("Config file {:?} not found.", config_path);
        }
    }

    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("slotrun.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    build_config(&config_vec, "SLOTRUN")
}

/// Files listed first take precedence over later ones; environment variables
/// under `env_prefix` override all files.
fn build_config(files: &[PathBuf], env_prefix: &str) -> Result<Config, config::ConfigError> {
    let settings = config::Config::builder();
    let settings = files.iter().rev().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("trainer.extra_args"),
        )
        .build()?
        .try_deserialize()
}
