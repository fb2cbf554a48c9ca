// kiln-common/src/pipeline.rs
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KilnError;
use crate::keg::InstalledKeg;
use crate::model::Formula;

/// Stages of one install attempt, in the order they are reached.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Stage {
    #[default]
    Pending,
    SourceAcquired,
    DependenciesResolved,
    Sandboxed,
    Built,
    Tested,
    Verified,
}

impl Stage {
    /// The stage an attempt at `self` is trying to enter.
    pub fn next(self) -> Self {
        match self {
            Self::Pending => Self::SourceAcquired,
            Self::SourceAcquired => Self::DependenciesResolved,
            Self::DependenciesResolved => Self::Sandboxed,
            Self::Sandboxed => Self::Built,
            Self::Built => Self::Tested,
            Self::Tested | Self::Verified => Self::Verified,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::SourceAcquired => "source-acquired",
            Self::DependenciesResolved => "dependencies-resolved",
            Self::Sandboxed => "sandboxed",
            Self::Built => "built",
            Self::Tested => "tested",
            Self::Verified => "verified",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Verified,
    /// `stage` is the stage the attempt failed to enter.
    Failed { stage: Stage, error: KilnError },
}

impl AttemptOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }

    pub fn error(&self) -> Option<&KilnError> {
        match self {
            Self::Verified => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub command: String,
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStatus {
    Success,
    Failed { step: usize, exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResult {
    pub status: InstallStatus,
    pub steps: Vec<StepOutcome>,
}

impl InstallResult {
    pub fn is_success(&self) -> bool {
        self.status == InstallStatus::Success
    }

    pub fn failed_step(&self) -> Option<&StepOutcome> {
        match self.status {
            InstallStatus::Success => None,
            InstallStatus::Failed { step, .. } => self.steps.iter().find(|s| s.index == step),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub description: String,
    pub passed: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub outcomes: Vec<AssertionOutcome>,
    pub passed: bool,
    pub failure_reason: Option<String>,
}

impl VerificationResult {
    pub fn from_outcomes(outcomes: Vec<AssertionOutcome>) -> Self {
        let failure_reason = outcomes
            .iter()
            .find(|o| !o.passed)
            .map(|o| o.description.clone());
        Self {
            passed: failure_reason.is_none(),
            failure_reason,
            outcomes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub formula: String,
    pub outcome: AttemptOutcome,
    pub stage_reached: Stage,
    pub install: Option<InstallResult>,
    pub verification: Option<VerificationResult>,
    pub keg: Option<InstalledKeg>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub name: String,
    pub formula: Arc<Formula>,
    /// Requested on the command line rather than pulled in as a dependency.
    pub is_target: bool,
    /// Jobs of this plan that must be verified first.
    pub depends_on: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PlannedOperations {
    /// Dependencies before dependents.
    pub jobs: Vec<PlannedJob>,
    pub errors: Vec<(String, KilnError)>,
    pub already_installed: HashSet<String>,
}

#[derive(Debug, Clone)]
pub enum JobProcessingState {
    WaitingForDependencies,
    Dispatched,
    Succeeded,
    Failed(Arc<KilnError>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        total_jobs: usize,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
    },
    PlanningStarted,
    PlanningFinished {
        job_count: usize,
    },
    JobDispatched {
        target_id: String,
    },
    AttemptStarted {
        target_id: String,
    },
    StageReached {
        target_id: String,
        stage: Stage,
    },
    BuildStepStarted {
        target_id: String,
        index: usize,
        command: String,
    },
    SandboxTornDown {
        target_id: String,
    },
    JobSuccess {
        target_id: String,
        version: String,
    },
    JobFailed {
        target_id: String,
        stage: Option<Stage>,
        error: String,
    },
    LogInfo {
        message: String,
    },
    LogWarn {
        message: String,
    },
    LogError {
        message: String,
    },
}

impl PipelineEvent {
    pub fn job_failed(target_id: String, stage: Option<Stage>, error: &KilnError) -> Self {
        PipelineEvent::JobFailed {
            target_id,
            stage,
            error: error.to_string(),
        }
    }
}
