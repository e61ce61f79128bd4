//! Loading a directory of numbered training configs into a job queue.
//!
//! Each `<n>.yaml` file is one job. Besides the trainer's own settings a file
//! may carry keys only the scheduler understands:
//!
//! - any key containing `num_envs`: how many environments (ports) the job opens
//! - any key containing `run_id`: the job's run identifier
//! - any key containing `opt_stop`: a stop condition, a mapping with `tag`
//!   and optional `min`, `max`, `step`
//!
//! Keys containing `opt_` are scheduler options and are stripped from the
//! sanitized copy written to the staging directory, which is what the trainer
//! is launched with.

use crate::core::job::{JobDescriptor, StopCondition, DEFAULT_STOP_MAX, DEFAULT_STOP_MIN};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;
use tempfile::TempDir;

const RESOURCE_KEY: &str = "num_envs";
const RUN_ID_KEY: &str = "run_id";
const STOP_MARKER: &str = "opt_stop";
const OPTION_PREFIX: &str = "opt_";
const BEHAVIORS_KEY: &str = "behaviors";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("cannot read catalog directory {}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read config {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
    #[error("cannot write sanitized config to {}", path.display())]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no usable job configs in {}", path.display())]
    Empty { path: PathBuf },
}

/// Configuration tree with scheduler-relevant structure made explicit:
/// mappings are walked, everything else (scalars, sequences) is opaque.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNode {
    Leaf(Value),
    Mapping(Vec<(Value, ConfigNode)>),
}

impl ConfigNode {
    pub fn from_yaml(value: Value) -> Self {
        match value {
            Value::Mapping(map) => ConfigNode::Mapping(
                map.into_iter()
                    .map(|(k, v)| (k, ConfigNode::from_yaml(v)))
                    .collect(),
            ),
            other => ConfigNode::Leaf(other),
        }
    }

    pub fn into_yaml(self) -> Value {
        match self {
            ConfigNode::Leaf(value) => value,
            ConfigNode::Mapping(entries) => Value::Mapping(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.into_yaml()))
                    .collect::<Mapping>(),
            ),
        }
    }

    /// Look up a direct child by string key.
    pub fn get(&self, key: &str) -> Option<&ConfigNode> {
        match self {
            ConfigNode::Mapping(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            ConfigNode::Leaf(_) => None,
        }
    }
}

/// Scheduler-only settings pulled out of one config.
#[derive(Debug, Default)]
pub struct SchedulerKeys {
    pub run_id: Option<String>,
    pub resource_units: Option<u32>,
    pub stop_conditions: Vec<StopCondition>,
}

/// Walk `node`, collecting scheduler keys into `keys` and returning the
/// sanitized tree without any `opt_` keys. The input is left untouched.
pub fn interpret(node: &ConfigNode, keys: &mut SchedulerKeys) -> Result<ConfigNode, String> {
    let ConfigNode::Mapping(entries) = node else {
        return Ok(node.clone());
    };

    let mut sanitized = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let name = key_name(key);

        if name.contains(RESOURCE_KEY) && keys.resource_units.is_none() {
            keys.resource_units = Some(parse_resource_units(&name, value)?);
        }
        if name.contains(RUN_ID_KEY) && keys.run_id.is_none() {
            keys.run_id = Some(parse_run_id(&name, value)?);
        }
        if name.contains(STOP_MARKER) {
            let condition = parse_stop_condition(value)
                .map_err(|reason| format!("stop condition `{name}`: {reason}"))?;
            tracing::info!("Found stop condition - {}", condition);
            keys.stop_conditions.push(condition);
        }

        if name.contains(OPTION_PREFIX) {
            continue;
        }
        let value = match value {
            ConfigNode::Mapping(_) => interpret(value, keys)?,
            leaf => leaf.clone(),
        };
        sanitized.push((key.clone(), value));
    }

    Ok(ConfigNode::Mapping(sanitized))
}

fn key_name(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn leaf(node: &ConfigNode) -> Option<&Value> {
    match node {
        ConfigNode::Leaf(value) => Some(value),
        ConfigNode::Mapping(_) => None,
    }
}

fn parse_resource_units(name: &str, node: &ConfigNode) -> Result<u32, String> {
    let units = leaf(node)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("`{name}` must be a positive integer"))?;
    match u32::try_from(units) {
        Ok(0) | Err(_) => Err(format!("`{name}` must be a positive integer, got {units}")),
        Ok(units) => Ok(units),
    }
}

fn parse_run_id(name: &str, node: &ConfigNode) -> Result<String, String> {
    let run_id = match leaf(node) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if run_id.is_empty() {
        return Err(format!("`{name}` must be a non-empty string"));
    }
    Ok(run_id)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_stop_condition(node: &ConfigNode) -> Result<StopCondition, String> {
    if !matches!(node, ConfigNode::Mapping(_)) {
        return Err("expected a mapping with a `tag`".to_string());
    }
    let field = |name: &str| node.get(name).and_then(leaf);

    let tag = match field("tag") {
        Some(Value::String(tag)) if !tag.trim().is_empty() => tag.clone(),
        _ => return Err("no tag found".to_string()),
    };
    let min = match field("min") {
        Some(v) => as_f64(v).ok_or("`min` is not a number")?,
        None => DEFAULT_STOP_MIN,
    };
    let max = match field("max") {
        Some(v) => as_f64(v).ok_or("`max` is not a number")?,
        None => DEFAULT_STOP_MAX,
    };
    let step = match field("step") {
        Some(v) => as_u64(v).ok_or("`step` is not a non-negative integer")?,
        None => 0,
    };

    Ok(StopCondition::new(tag, min, max, step))
}

/// Identifiers the metrics backend files each behavior under.
fn sub_run_ids(root: &ConfigNode, run_id: &str) -> Vec<String> {
    match root.get(BEHAVIORS_KEY) {
        Some(ConfigNode::Mapping(behaviors)) => behaviors
            .iter()
            .map(|(name, _)| format!("{run_id}{MAIN_SEPARATOR}{}", key_name(name)))
            .collect(),
        _ => Vec::new(),
    }
}

/// The ordered job queue plus the catalog-wide stop conditions.
#[derive(Debug, Clone)]
pub struct Catalog {
    jobs: Vec<JobDescriptor>,
    stop_conditions: Vec<StopCondition>,
    /// Private staging directory holding the sanitized copies. Removed when
    /// the last clone of the catalog is dropped.
    staging: Option<Arc<TempDir>>,
}

impl Catalog {
    /// Load every `<integer>.yaml` in `dir`, ordered numerically, writing the
    /// sanitized copies into a fresh directory under `staging_root`.
    ///
    /// Each load gets its own directory, so instances sharing a staging root
    /// never see each other's copies.
    ///
    /// Files that fail to load are logged and skipped; only an unreadable
    /// directory or an empty result is an error.
    pub fn load(dir: &Path, staging_root: &Path) -> Result<Self, CatalogError> {
        let read_dir_err = |source| CatalogError::ReadDir {
            path: dir.to_path_buf(),
            source,
        };
        let dir = fs::canonicalize(dir).map_err(read_dir_err)?;

        let mut candidates: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir).map_err(read_dir_err)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                    continue;
                }
            };
            match numbered_config(&path) {
                Some(key) => candidates.push((key, path)),
                None => tracing::debug!("Ignoring {}", path.display()),
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let stage_err = |source| CatalogError::Stage {
            path: staging_root.to_path_buf(),
            source,
        };
        fs::create_dir_all(staging_root).map_err(stage_err)?;
        let staging_root = fs::canonicalize(staging_root).map_err(stage_err)?;
        let staging = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&staging_root)
            .map_err(stage_err)?;
        let staging_dir = staging.path().to_path_buf();
        tracing::debug!("Staging sanitized configs in {}", staging_dir.display());

        let mut jobs = Vec::with_capacity(candidates.len());
        for (key, path) in candidates {
            match load_job(jobs.len(), key, &path, &staging_dir) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    let detail = std::error::Error::source(&e)
                        .map(|s| format!(": {s}"))
                        .unwrap_or_default();
                    tracing::error!("Skipping config: {e}{detail}");
                }
            }
        }

        if jobs.is_empty() {
            return Err(CatalogError::Empty { path: dir });
        }

        tracing::info!("Loaded {} job configs from {}", jobs.len(), dir.display());
        Ok(Self {
            staging: Some(Arc::new(staging)),
            ..Self::from_jobs(jobs)
        })
    }

    /// Build a catalog from already-loaded descriptors, collapsing stop
    /// conditions that share a tag (the first declaration wins).
    pub fn from_jobs(jobs: Vec<JobDescriptor>) -> Self {
        let mut stop_conditions: Vec<StopCondition> = Vec::new();
        for job in &jobs {
            for condition in &job.stop_conditions {
                if stop_conditions.contains(condition) {
                    tracing::debug!(
                        "Ignoring duplicate stop condition for tag {} from {}",
                        condition.tag,
                        job.run_id
                    );
                } else {
                    stop_conditions.push(condition.clone());
                }
            }
        }
        Self {
            jobs,
            stop_conditions,
            staging: None,
        }
    }

    pub fn jobs(&self) -> &[JobDescriptor] {
        &self.jobs
    }

    pub fn get(&self, index: usize) -> Option<&JobDescriptor> {
        self.jobs.get(index)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Directory the sanitized copies were written to, if this catalog was
    /// loaded from disk.
    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging.as_deref().map(TempDir::path)
    }

    /// Deduplicated stop conditions, applied to every running job.
    pub fn stop_conditions(&self) -> &[StopCondition] {
        &self.stop_conditions
    }
}

/// `Some(n)` for files named `<n>.yaml` / `<n>.yml`.
fn numbered_config(path: &Path) -> Option<u64> {
    if !path.is_file() {
        return None;
    }
    let ext = path.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case("yaml") && !ext.eq_ignore_ascii_case("yml") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn load_job(
    index: usize,
    key: u64,
    path: &Path,
    staging_dir: &Path,
) -> Result<JobDescriptor, CatalogError> {
    let text = fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_yaml::from_str(&text).map_err(|source| CatalogError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let invalid = |reason: String| CatalogError::Invalid {
        path: path.to_path_buf(),
        reason,
    };

    let root = ConfigNode::from_yaml(value);
    if !matches!(root, ConfigNode::Mapping(_)) {
        return Err(invalid("top level must be a mapping".to_string()));
    }

    let mut keys = SchedulerKeys::default();
    let sanitized = interpret(&root, &mut keys).map_err(invalid)?;

    let run_id = keys
        .run_id
        .ok_or_else(|| invalid(format!("no `{RUN_ID_KEY}` key found")))?;
    let resource_units = keys.resource_units.unwrap_or_else(|| {
        tracing::debug!(
            "{} declares no `{}`, assuming 1 environment",
            path.display(),
            RESOURCE_KEY
        );
        1
    });

    let launch_path = staging_dir.join(path.file_name().unwrap_or_default());
    let rendered = serde_yaml::to_string(&sanitized.into_yaml()).map_err(|e| invalid(e.to_string()))?;
    fs::write(&launch_path, rendered).map_err(|source| CatalogError::Stage {
        path: launch_path.clone(),
        source,
    })?;

    let mut builder = JobDescriptor::builder()
        .index(index)
        .key(key)
        .config_path(path)
        .launch_path(launch_path)
        .run_id(run_id.clone())
        .resource_units(resource_units);
    for sub_run_id in sub_run_ids(&root, &run_id) {
        builder = builder.sub_run_id(sub_run_id);
    }
    for condition in keys.stop_conditions {
        builder = builder.stop_condition(condition);
    }
    Ok(builder.build())
}
