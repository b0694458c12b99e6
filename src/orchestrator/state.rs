use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Which of the two deployment steps is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeployPhase {
    /// Resource preparation: model and dependency downloads.
    Phase1,
    /// Install and service start.
    Phase2,
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployPhase::Phase1 => f.write_str("Phase 1"),
            DeployPhase::Phase2 => f.write_str("Phase 2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordPhase {
    None,
    Preparing,
    Starting,
    Running,
}

/// What is currently running remotely. At most one exists, owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRecord {
    pub username: String,
    pub gpu: String,
    pub phase: RecordPhase,
    pub started_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn new(username: &str, gpu: &str, phase: RecordPhase) -> Self {
        Self {
            username: username.to_string(),
            gpu: gpu.to_string(),
            phase,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    #[default]
    Idle,
    Preparing,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkloadState::Idle => "idle",
            WorkloadState::Preparing => "preparing",
            WorkloadState::Starting => "starting",
            WorkloadState::Running => "running",
            WorkloadState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of the workload, readable without waiting for an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkloadSnapshot {
    pub state: WorkloadState,
    pub record: Option<DeploymentRecord>,
}

#[derive(Debug, Clone)]
pub struct DeploymentSettings {
    pub app_name: String,
    pub default_gpu: String,
    pub phase1_file: PathBuf,
    pub phase2_file: PathBuf,
    pub run_file: PathBuf,
    pub phase1_timeout: Duration,
    pub phase2_timeout: Duration,
    pub run_timeout: Duration,
    /// Budget for short confirmation calls such as `app stop`.
    pub command_timeout: Duration,
    pub readiness_max_wait: Duration,
    pub readiness_interval: Duration,
    /// Pause between launching the run command and the first readiness probe.
    pub startup_grace: Duration,
}

impl DeploymentSettings {
    pub fn phase_file(&self, phase: DeployPhase) -> &PathBuf {
        match phase {
            DeployPhase::Phase1 => &self.phase1_file,
            DeployPhase::Phase2 => &self.phase2_file,
        }
    }

    pub fn phase_timeout(&self, phase: DeployPhase) -> Duration {
        match phase {
            DeployPhase::Phase1 => self.phase1_timeout,
            DeployPhase::Phase2 => self.phase2_timeout,
        }
    }
}
