use smallvec::SmallVec;
use std::fmt;
use std::path::PathBuf;

/// Contiguous block of ports reserved for one job.
/// Most jobs launch a handful of environments, so we inline up to 8.
pub type PortBlock = SmallVec<[u16; 8]>;

pub const DEFAULT_STOP_MIN: f64 = -999_999_999.0;
pub const DEFAULT_STOP_MAX: f64 = 999_999_999.0;

/// A rule that halts a running job once a watched scalar leaves `[min, max]`.
///
/// Two conditions are equal when they watch the same tag; bounds and step are
/// ignored. The catalog relies on this to collapse duplicates.
#[derive(Debug, Clone)]
pub struct StopCondition {
    pub tag: String,
    pub min: f64,
    pub max: f64,
    /// Verdicts are only honored once the series reaches this step.
    pub min_step: u64,
}

impl StopCondition {
    /// Build a condition, clamping an inverted `max` up to `min`.
    pub fn new(tag: impl Into<String>, min: f64, max: f64, min_step: u64) -> Self {
        Self {
            tag: tag.into(),
            min,
            max: max.max(min),
            min_step,
        }
    }

    pub fn builder(tag: impl Into<String>) -> StopConditionBuilder {
        StopConditionBuilder::new(tag)
    }
}

impl PartialEq for StopCondition {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl Eq for StopCondition {}

impl fmt::Display for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tag: {}, step: {}, min: {}, max: {}",
            self.tag, self.min_step, self.min, self.max
        )
    }
}

pub struct StopConditionBuilder {
    tag: String,
    min: f64,
    max: f64,
    min_step: u64,
}

impl StopConditionBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            min: DEFAULT_STOP_MIN,
            max: DEFAULT_STOP_MAX,
            min_step: 0,
        }
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = min;
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = max;
        self
    }

    pub fn min_step(mut self, step: u64) -> Self {
        self.min_step = step;
        self
    }

    pub fn build(self) -> StopCondition {
        StopCondition::new(self.tag, self.min, self.max, self.min_step)
    }
}

/// Everything the scheduler needs to know about one queued config.
///
/// Built once by the catalog and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Position in the queue (0-based, follows the numeric file names).
    pub index: usize,
    /// Integer parsed from the config's file stem.
    pub key: u64,
    /// Absolute path of the config as found in the catalog directory.
    pub config_path: PathBuf,
    /// Sanitized copy handed to the trainer (scheduler-only keys removed).
    pub launch_path: PathBuf,
    pub run_id: String,
    /// One fully-qualified identifier per behavior, used for metric queries.
    pub sub_run_ids: Vec<String>,
    /// Number of parallel environments, i.e. ports, the job will open.
    pub resource_units: u32,
    /// Stop conditions declared in this job's own file.
    pub stop_conditions: Vec<StopCondition>,
}

#[derive(Default)]
pub struct JobDescriptorBuilder {
    index: usize,
    key: u64,
    config_path: PathBuf,
    launch_path: Option<PathBuf>,
    run_id: String,
    sub_run_ids: Vec<String>,
    resource_units: u32,
    stop_conditions: Vec<StopCondition>,
}

impl JobDescriptorBuilder {
    pub fn new() -> Self {
        Self {
            resource_units: 1,
            ..Default::default()
        }
    }

    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self.key = index as u64;
        self
    }

    pub fn key(mut self, key: u64) -> Self {
        self.key = key;
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    pub fn launch_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.launch_path = Some(path.into());
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn sub_run_id(mut self, sub_run_id: impl Into<String>) -> Self {
        self.sub_run_ids.push(sub_run_id.into());
        self
    }

    pub fn resource_units(mut self, units: u32) -> Self {
        self.resource_units = units;
        self
    }

    pub fn stop_condition(mut self, condition: StopCondition) -> Self {
        self.stop_conditions.push(condition);
        self
    }

    pub fn build(self) -> JobDescriptor {
        let sub_run_ids = if self.sub_run_ids.is_empty() {
            vec![self.run_id.clone()]
        } else {
            self.sub_run_ids
        };
        JobDescriptor {
            index: self.index,
            key: self.key,
            launch_path: self
                .launch_path
                .unwrap_or_else(|| self.config_path.clone()),
            config_path: self.config_path,
            run_id: self.run_id,
            sub_run_ids,
            resource_units: self.resource_units,
            stop_conditions: self.stop_conditions,
        }
    }
}

impl JobDescriptor {
    pub fn builder() -> JobDescriptorBuilder {
        JobDescriptorBuilder::new()
    }
}
