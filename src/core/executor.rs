use crate::core::job::JobDescriptor;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

#[derive(Debug, thiserror::Error)]
#[error("failed to launch `{program}` for run {run_id}")]
pub struct SpawnError {
    pub program: String,
    pub run_id: String,
    #[source]
    pub source: std::io::Error,
}

/// Liveness of a supervised process as seen by a non-blocking poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ProcessStatus {
    #[strum(to_string = "running")]
    Running,
    /// `None` when the process died from a signal and has no exit code.
    #[strum(to_string = "exited")]
    Exited(Option<i32>),
}

impl ProcessStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessStatus::Exited(Some(0)))
    }
}

/// Handle to one launched job.
pub trait JobProcess: Send {
    /// Never blocks. Errors while querying are reported as the process having
    /// exited without a code, so the slot is reclaimed rather than leaked.
    fn poll(&mut self) -> ProcessStatus;

    /// Best effort, immediate kill. No grace period.
    fn terminate(&mut self);

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Launch strategy for jobs, injected into the scheduler.
pub trait Executor {
    fn spawn(&self, job: &JobDescriptor, base_port: u16) -> Result<Box<dyn JobProcess>, SpawnError>;
}

/// Runs the trainer as a child process:
/// `<program> [extra_args..] <launch config> <port_flag>=<base port>`.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    port_flag: String,
    extra_args: Vec<String>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, port_flag: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            port_flag: port_flag.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn build_args(&self, job: &JobDescriptor, base_port: u16) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.extra_args.iter().map(OsString::from).collect();
        args.push(job.launch_path.clone().into_os_string());
        args.push(format!("{}={}", self.port_flag, base_port).into());
        args
    }
}

impl Executor for ProcessExecutor {
    fn spawn(&self, job: &JobDescriptor, base_port: u16) -> Result<Box<dyn JobProcess>, SpawnError> {
        let args = self.build_args(job, base_port);
        tracing::debug!(
            "Launching {} with args {:?}",
            self.program.display(),
            args
        );

        let child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError {
                program: self.program.display().to_string(),
                run_id: job.run_id.clone(),
                source,
            })?;

        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: tokio::process::Child,
}

impl JobProcess for ChildProcess {
    fn poll(&mut self) -> ProcessStatus {
        match self.child.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => ProcessStatus::Exited(status.code()),
            Err(e) => {
                tracing::error!("Failed to poll process {:?}: {}", self.child.id(), e);
                ProcessStatus::Exited(None)
            }
        }
    }

    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already reaped processes report InvalidInput; nothing left to kill.
            tracing::debug!("Kill of process {:?} skipped: {}", self.child.id(), e);
        }
        // Reap right away if the kill already landed; otherwise tokio's
        // orphan reaper collects it once the handle is dropped.
        let _ = self.child.try_wait();
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}
