use owo_colors::OwoColorize;
use slotrun::core::catalog::Catalog;
use slotrun::core::job::{StopCondition, DEFAULT_STOP_MAX, DEFAULT_STOP_MIN};
use slotrun::core::scheduler::{RunOutcome, RunSummary};
use slotrun::utils::{format_duration, format_ports};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "FILE")]
    file: String,
    #[tabled(rename = "RUN ID")]
    run_id: String,
    #[tabled(rename = "UNITS")]
    units: u32,
    #[tabled(rename = "PORTS")]
    ports: String,
    #[tabled(rename = "SUB-RUNS")]
    sub_runs: String,
}

#[derive(Tabled)]
struct ConditionRow {
    #[tabled(rename = "TAG")]
    tag: String,
    #[tabled(rename = "MIN")]
    min: String,
    #[tabled(rename = "MAX")]
    max: String,
    #[tabled(rename = "FROM STEP")]
    step: u64,
}

fn bound(value: f64, unset: f64) -> String {
    if value == unset {
        "-".to_string()
    } else {
        value.to_string()
    }
}

impl From<&StopCondition> for ConditionRow {
    fn from(condition: &StopCondition) -> Self {
        Self {
            tag: condition.tag.clone(),
            min: bound(condition.min, DEFAULT_STOP_MIN),
            max: bound(condition.max, DEFAULT_STOP_MAX),
            step: condition.min_step,
        }
    }
}

/// Job table for `--dry-run`. The ports column shows the block each job would
/// get if it ran alone.
pub fn render_catalog(catalog: &Catalog, base_port: u16) -> String {
    if catalog.is_empty() {
        return "No jobs.".to_string();
    }
    let rows: Vec<JobRow> = catalog
        .jobs()
        .iter()
        .map(|job| {
            let last = u32::from(base_port) + job.resource_units.saturating_sub(1);
            let ports: Vec<u16> = (u32::from(base_port)..=last)
                .filter_map(|p| u16::try_from(p).ok())
                .collect();
            JobRow {
                index: job.index,
                file: job
                    .config_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                run_id: job.run_id.clone(),
                units: job.resource_units,
                ports: format_ports(&ports),
                sub_runs: job.sub_run_ids.join(", "),
            }
        })
        .collect();

    let mut out = Table::new(&rows).with(Style::empty()).to_string();

    if !catalog.stop_conditions().is_empty() {
        let conditions: Vec<ConditionRow> = catalog
            .stop_conditions()
            .iter()
            .map(ConditionRow::from)
            .collect();
        out.push_str("\n\nStop conditions:\n");
        out.push_str(&Table::new(&conditions).with(Style::empty()).to_string());
    }
    out
}

pub fn render_summary(summary: &RunSummary) -> String {
    let mut lines = Vec::new();

    let headline = match summary.outcome {
        RunOutcome::Interrupted => "Training was interrupted.".yellow().bold().to_string(),
        RunOutcome::Completed if summary.failed.is_empty() => {
            "All training runs completed.".green().bold().to_string()
        }
        RunOutcome::Completed => "Some training runs failed.".red().bold().to_string(),
    };
    lines.push(format!(
        "{} ({})",
        headline,
        format_duration(summary.elapsed)
    ));

    if !summary.completed.is_empty() {
        lines.push(format!(
            "  {} {}",
            "completed:".green(),
            summary.completed.join(", ")
        ));
    }
    for stopped in &summary.stopped {
        lines.push(format!(
            "  {} {} ({})",
            "stopped:".yellow(),
            stopped.run_id,
            stopped.reason
        ));
    }
    if !summary.failed.is_empty() {
        lines.push(format!(
            "  {} {}",
            "incomplete:".red(),
            summary.failed.join(", ")
        ));
    }
    if !summary.interrupted.is_empty() {
        lines.push(format!(
            "  {} {}",
            "terminated:".yellow(),
            summary.interrupted.join(", ")
        ));
    }
    if summary.pending > 0 {
        lines.push(format!("  {} {}", "never started:".dimmed(), summary.pending));
    }

    lines.join("\n")
}
