//! Run state representation
//!
//! Tracks where a run is, how many attempts the current step has made, and
//! why a run ended. The drive loop is the only writer; the controller and
//! any control surface read snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::ports::CaptureError;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    /// Stop requested, drive loop not yet at a checkpoint
    Stopping,
    Stopped,
    Failed,
    Completed,
}

impl RunStatus {
    /// Whether the run has ended
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Stopped | RunStatus::Failed | RunStatus::Completed
        )
    }
}

/// Why one attempt of a step did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// Frame captured, no candidate cleared the threshold
    NoMatch,
    /// The capture collaborator failed
    Capture { error: CaptureError },
    /// The action collaborator reported failure
    Action,
}

impl AttemptFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AttemptFailure::NoMatch => "no_match",
            AttemptFailure::Capture {
                error: CaptureError::Unavailable,
            } => "capture_unavailable",
            AttemptFailure::Capture {
                error: CaptureError::TimedOut,
            } => "capture_timed_out",
            AttemptFailure::Action => "action_failure",
        }
    }
}

/// Why a step failed, or why a run ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The graph, settings, or patterns are unusable
    Configuration { message: String },
    /// The step spent its wall-clock budget
    Timeout { step: String },
    /// The step used up its attempts
    RetriesExhausted {
        step: String,
        attempts: u32,
        last: AttemptFailure,
    },
    /// A success edge pointed at `@abort`
    AbortEdge { step: String },
    /// The run's worker thread panicked
    WorkerPanicked,
}

impl FailureReason {
    /// Stable reason code for status consumers
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Configuration { .. } => "configuration",
            FailureReason::Timeout { .. } => "timeout",
            FailureReason::RetriesExhausted { .. } => "retries_exhausted",
            FailureReason::AbortEdge { .. } => "abort_edge",
            FailureReason::WorkerPanicked => "worker_panicked",
        }
    }

    /// Step the failure belongs to, if any
    pub fn step(&self) -> Option<&str> {
        match self {
            FailureReason::Configuration { .. } | FailureReason::WorkerPanicked => None,
            FailureReason::Timeout { step }
            | FailureReason::RetriesExhausted { step, .. }
            | FailureReason::AbortEdge { step } => Some(step),
        }
    }
}

/// Pattern that triggered the most recent action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMatch {
    pub step: String,
    pub pattern: String,
    pub confidence: f32,
}

/// Full run state snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub current_step_id: Option<String>,
    pub attempt_count: u32,
    pub cancel_requested: bool,
    /// Steps that finished successfully (including skipped ones)
    pub steps_completed: u64,
    pub failure: Option<FailureReason>,
    pub last_match: Option<LastMatch>,
}

impl RunState {
    /// The control-surface projection
    pub fn summary(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.status,
            current_step_id: self.current_step_id.clone(),
            attempt_count: self.attempt_count,
            reason: self.failure.as_ref().map(|f| f.code().to_string()),
        }
    }
}

/// `get_status()` result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: RunStatus,
    pub current_step_id: Option<String>,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Cooperative cancellation flag shared between the drive loop and callers
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Never blocks.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Run state plus its cancellation flag, shared by a run and its observers
#[derive(Debug, Default)]
pub struct SharedState {
    cancel: CancelToken,
    state: RwLock<RunState>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared state that is already finished with `failure`
    pub fn failed(failure: FailureReason) -> Self {
        let shared = Self::new();
        shared.update(|s| {
            s.status = RunStatus::Failed;
            s.failure = Some(failure);
        });
        shared
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Point-in-time copy of the run state
    pub fn snapshot(&self) -> RunState {
        let mut state = match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        state.cancel_requested = self.cancel.is_cancelled();
        if state.cancel_requested && state.status == RunStatus::Running {
            state.status = RunStatus::Stopping;
        }
        state
    }

    /// Mutate the run state (drive loop only)
    pub(crate) fn update(&self, f: impl FnOnce(&mut RunState)) {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}
