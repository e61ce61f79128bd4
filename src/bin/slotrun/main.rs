use anyhow::{anyhow, Context};
use clap::Parser;
use slotrun::core::catalog::Catalog;
use slotrun::core::executor::ProcessExecutor;
use slotrun::core::metrics::StopConditionEvaluator;
use slotrun::core::scheduler::{RunOutcome, SlotScheduler};
use std::process::ExitCode;
use tokio::sync::oneshot;
use tracing_appender::non_blocking::WorkerGuard;

mod cli;
mod report;

// Use mimalloc only on x86_64 to avoid cross-compilation issues
#[cfg(target_arch = "x86_64")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    match real_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

/// Console (stderr) plus daily rolling file appender.
fn init_tracing(args: &cli::SlotRun) -> anyhow::Result<WorkerGuard> {
    let log_dir = slotrun::core::get_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("slotrun")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(args.verbosity.tracing_level_filter())
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Resolves once Ctrl-C is received. If the signal handler cannot be
/// installed the run simply cannot be interrupted.
fn interrupt_signal() -> impl std::future::Future<Output = ()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl-C, shutting down after the current tick");
                let _ = tx.send(());
            }
            Err(e) => {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                // Holding `tx` here keeps the receiver pending.
                std::future::pending::<()>().await;
            }
        }
    });
    async move {
        if rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn real_main() -> anyhow::Result<ExitCode> {
    let args = cli::SlotRun::parse();
    let _guard = init_tracing(&args)?;

    let mut config = slotrun::config::load_config(args.config.as_ref())?;
    args.apply(&mut config);
    tracing::debug!("{:?}", config);

    let catalog_dir = config
        .scheduler
        .catalog_dir
        .clone()
        .ok_or_else(|| anyhow!("No config folder given (positional FOLDER or scheduler.catalog_dir)"))?;
    let staging_dir = match config.scheduler.staging_dir.clone() {
        Some(dir) => dir,
        None => slotrun::core::default_staging_dir()?,
    };

    let catalog = Catalog::load(&catalog_dir, &staging_dir)
        .with_context(|| format!("Failed to load job configs from {}", catalog_dir.display()))?;
    if let Some(dir) = catalog.staging_dir() {
        tracing::info!("Staged {} configs in {}", catalog.len(), dir.display());
    }

    if args.dry_run {
        println!("{}", report::render_catalog(&catalog, config.scheduler.base_port));
        return Ok(ExitCode::SUCCESS);
    }

    let executor = ProcessExecutor::new(
        config.trainer.program.clone(),
        config.trainer.port_flag.clone(),
    )
    .with_extra_args(config.trainer.extra_args.clone());

    let mut builder = SlotScheduler::builder(catalog)
        .with_executor(Box::new(executor))
        .with_num_parallel(config.scheduler.num_parallel)
        .with_max_workers(config.scheduler.max_workers)
        .with_base_port(config.scheduler.base_port)
        .with_interval(config.scheduler.interval());

    if config.metrics.enabled {
        let evaluator =
            StopConditionEvaluator::new(config.metrics.endpoint.clone(), config.metrics.timeout())
                .context("Failed to build metrics client")?;
        tracing::info!("Stop conditions are checked against {}", evaluator.endpoint());
        builder = builder.with_evaluator(evaluator);
    }

    let mut scheduler = builder.build()?;
    tracing::info!(
        "Scheduling {} jobs on {} slots ({} workers max, ports from {})",
        scheduler.catalog().len(),
        config.scheduler.num_parallel,
        config.scheduler.max_workers,
        config.scheduler.base_port
    );

    let summary = scheduler.run(interrupt_signal()).await?;
    println!("{}", report::render_summary(&summary));

    Ok(match summary.outcome {
        RunOutcome::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
        RunOutcome::Completed if summary.is_success() => ExitCode::SUCCESS,
        RunOutcome::Completed => ExitCode::FAILURE,
    })
}
