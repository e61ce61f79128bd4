//! Stop-condition evaluation against a TensorBoard-style scalars endpoint.
//!
//! The endpoint answers `GET <endpoint>?run=<run>&tag=<tag>` with the whole
//! series as `[[wall_time, step, value], ...]` in chronological order. Only the
//! last point matters here.

use crate::core::job::StopCondition;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:6006/data/plugin/scalars/scalars";
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum MetricsQueryError {
    #[error("request to metrics endpoint failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("metrics endpoint answered {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed scalar series: {0}")]
    Body(#[source] reqwest::Error),
    #[error("scalar series is empty")]
    Empty,
}

/// Latest point of a scalar series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarPoint {
    pub step: u64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    NoAction,
    Stop(String),
}

/// Decide whether `point` breaches `condition`. Bounds themselves are allowed.
pub fn judge(condition: &StopCondition, point: ScalarPoint) -> Verdict {
    if point.step < condition.min_step {
        return Verdict::NoAction;
    }
    if point.value < condition.min {
        Verdict::Stop(format!(
            "{}: {} < {} [step: {}]",
            condition.tag, point.value, condition.min, point.step
        ))
    } else if point.value > condition.max {
        Verdict::Stop(format!(
            "{}: {} > {} [step: {}]",
            condition.tag, point.value, condition.max, point.step
        ))
    } else {
        Verdict::NoAction
    }
}

fn ensure_rustls_provider_installed() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Another component may have installed a provider first; that is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub struct StopConditionEvaluator {
    client: reqwest::Client,
    endpoint: String,
    total_failures: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl StopConditionEvaluator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        if timeout.is_zero() {
            anyhow::bail!("metrics query timeout must be greater than zero");
        }
        ensure_rustls_provider_installed();
        let client = reqwest::Client::builder()
            .user_agent(format!("slotrun/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            total_failures: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Failed queries since startup.
    pub fn query_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Fetch the most recent point of `tag` for `run`.
    pub async fn latest(&self, run: &str, tag: &str) -> Result<ScalarPoint, MetricsQueryError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("run", run), ("tag", tag)])
            .send()
            .await
            .map_err(MetricsQueryError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetricsQueryError::Status(status));
        }

        let series: Vec<(f64, f64, f64)> =
            response.json().await.map_err(MetricsQueryError::Body)?;
        let &(_wall_time, step, value) = series.last().ok_or(MetricsQueryError::Empty)?;

        Ok(ScalarPoint {
            step: step.max(0.0) as u64,
            value,
        })
    }

    /// Evaluate one condition for one sub-run. Query failures never escalate:
    /// they count as "no verdict yet" and the caller retries next tick.
    pub async fn evaluate(&self, condition: &StopCondition, sub_run_id: &str) -> Verdict {
        match self.latest(sub_run_id, &condition.tag).await {
            Ok(point) => {
                let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if previous > 0 {
                    tracing::info!(
                        "Metrics endpoint reachable again after {} failed queries",
                        previous
                    );
                }
                judge(condition, point)
            }
            // TensorBoard answers 400 until the run has logged the tag.
            Err(MetricsQueryError::Status(status)) if status.is_client_error() => {
                tracing::debug!(
                    "No scalar data yet for {} / {} ({})",
                    sub_run_id,
                    condition.tag,
                    status
                );
                Verdict::NoAction
            }
            Err(MetricsQueryError::Empty) => {
                tracing::debug!("No scalar data yet for {} / {}", sub_run_id, condition.tag);
                Verdict::NoAction
            }
            Err(e) => {
                let total = self.total_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    "Could not query {} for {} / {}: {} ({} in a row, {} total)",
                    self.endpoint,
                    sub_run_id,
                    condition.tag,
                    e,
                    streak,
                    total
                );
                Verdict::NoAction
            }
        }
    }

    /// Check every condition against every sub-run and return the first stop
    /// verdict. Remaining pairs are not queried once one fires.
    pub async fn first_stop(
        &self,
        conditions: &[StopCondition],
        sub_run_ids: &[String],
    ) -> Option<String> {
        for condition in conditions {
            for sub_run_id in sub_run_ids {
                if let Verdict::Stop(reason) = self.evaluate(condition, sub_run_id).await {
                    return Some(reason);
                }
            }
        }
        None
    }
}
