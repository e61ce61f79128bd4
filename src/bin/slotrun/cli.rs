use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use slotrun::config::Config;

#[derive(Debug, Parser)]
#[command(
    name = "slotrun",
    author,
    version = slotrun::core::version(),
    about = "Run a folder of numbered training configs on a fixed pool of slots"
)]
#[command(styles = slotrun::utils::STYLES)]
pub struct SlotRun {
    /// Folder holding the job configs (0.yaml, 1.yaml, ...)
    pub folder: Option<PathBuf>,

    /// Number of jobs that may run at the same time
    pub num_parallel: Option<usize>,

    /// Maximum parallel environments across all running jobs
    pub max_workers: Option<u32>,

    /// First port handed out to trainers
    pub base_port: Option<u16>,

    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds between two scheduling passes
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Where sanitized configs are written before launch
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Trainer executable to launch
    #[arg(long, value_name = "PROGRAM")]
    pub trainer: Option<PathBuf>,

    /// Ignore stop conditions and never query the metrics endpoint
    #[arg(long)]
    pub no_metrics: bool,

    /// Print the job table and exit without launching anything
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

impl SlotRun {
    /// CLI flags override the config file and the environment.
    pub fn apply(&self, config: &mut Config) {
        if let Some(folder) = &self.folder {
            config.scheduler.catalog_dir = Some(folder.clone());
        }
        if let Some(num_parallel) = self.num_parallel {
            config.scheduler.num_parallel = num_parallel;
        }
        if let Some(max_workers) = self.max_workers {
            config.scheduler.max_workers = max_workers;
        }
        if let Some(base_port) = self.base_port {
            config.scheduler.base_port = base_port;
        }
        if let Some(interval) = self.interval {
            config.scheduler.interval_secs = interval;
        }
        if let Some(staging_dir) = &self.staging_dir {
            config.scheduler.staging_dir = Some(staging_dir.clone());
        }
        if let Some(trainer) = &self.trainer {
            config.trainer.program = trainer.clone();
        }
        if self.no_metrics {
            config.metrics.enabled = false;
        }
    }
}
