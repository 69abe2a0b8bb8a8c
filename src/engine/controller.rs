//! Run control surface
//!
//! `RunController` owns the collaborators and starts each run on its own
//! worker thread. Callers get a `RunHandle` for stopping and observing it;
//! stop requests never block.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use super::clock::{Clock, SystemClock};
use super::graph::StepGraph;
use super::sequencer::{RunOutcome, Sequencer};
use super::state::{FailureReason, RunState, RunStatus, SharedState, StatusSnapshot};
use crate::config::{ConfigurationError, EngineSettings};
use crate::ports::{ActionPort, FrameSource};
use crate::vision::PatternLibrary;

/// Control errors
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("A run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Failed to spawn run thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Handle to one started run
#[derive(Clone)]
pub struct RunHandle {
    id: u64,
    shared: Arc<SharedState>,
    worker: Arc<Mutex<Option<JoinHandle<RunOutcome>>>>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.id)
            .field("status", &self.shared.snapshot().status)
            .finish()
    }
}

impl RunHandle {
    fn new(id: u64, shared: Arc<SharedState>, worker: Option<JoinHandle<RunOutcome>>) -> Self {
        Self {
            id,
            shared,
            worker: Arc::new(Mutex::new(worker)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the run to stop at its next checkpoint
    pub fn request_stop(&self) {
        self.shared.cancel_token().cancel();
    }

    pub fn status(&self) -> RunState {
        self.shared.snapshot()
    }

    /// Whether the run has reached a terminal state or its thread has exited
    pub fn is_finished(&self) -> bool {
        if self.status().status.is_terminal() {
            return true;
        }
        self.lock_worker()
            .as_ref()
            .map_or(true, |worker| worker.is_finished())
    }

    /// Block until the worker exits. `None` when already joined, never
    /// spawned, or the worker panicked.
    pub fn join(&self) -> Option<RunOutcome> {
        let worker = self.lock_worker().take()?;
        match worker.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                log::error!("Run {} worker panicked", self.id);
                mark_panicked(&self.shared);
                None
            }
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<RunOutcome>>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn mark_panicked(shared: &SharedState) {
    shared.update(|s| {
        s.status = RunStatus::Failed;
        s.failure = Some(FailureReason::WorkerPanicked);
    });
}

/// Starts, stops and reports on runs. At most one run is active at a time.
pub struct RunController {
    library: Arc<PatternLibrary>,
    source: Arc<dyn FrameSource>,
    port: Arc<dyn ActionPort>,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<RunHandle>>,
    next_id: AtomicU64,
}

impl RunController {
    pub fn new(
        library: Arc<PatternLibrary>,
        source: Arc<dyn FrameSource>,
        port: Arc<dyn ActionPort>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            library,
            source,
            port,
            settings,
            clock: Arc::new(SystemClock::new()),
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Replace the time source used by every run
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn library(&self) -> &PatternLibrary {
        &self.library
    }

    /// Validate `graph` and run it on a new worker thread
    pub fn start(&self, graph: StepGraph) -> Result<RunHandle, ControlError> {
        let mut current = self.lock_current();
        if current.as_ref().is_some_and(|run| !run.is_finished()) {
            return Err(ControlError::AlreadyRunning);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sequencer = match Sequencer::new(
            graph,
            Arc::clone(&self.library),
            Arc::clone(&self.source),
            Arc::clone(&self.port),
            self.settings.clone(),
        ) {
            Ok(sequencer) => sequencer.with_clock(Arc::clone(&self.clock)),
            Err(e) => return Err(self.reject(&mut current, id, e)),
        };

        let shared = sequencer.shared();
        shared.update(|s| s.status = RunStatus::Running);

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("frame-pilot-run-{id}"))
            .spawn(move || {
                match panic::catch_unwind(AssertUnwindSafe(|| sequencer.run())) {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        log::error!("Run {} worker panicked", id);
                        mark_panicked(&worker_shared);
                        RunOutcome::Aborted(FailureReason::WorkerPanicked)
                    }
                }
            })
            .map_err(ControlError::Spawn)?;

        log::info!("Run {} started", id);
        let handle = RunHandle::new(id, shared, Some(worker));
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Parse a step graph definition and start it
    pub fn start_json(&self, definition: &str) -> Result<RunHandle, ControlError> {
        match StepGraph::from_json(definition) {
            Ok(graph) => self.start(graph),
            Err(e) => {
                let mut current = self.lock_current();
                if current.as_ref().is_some_and(|run| !run.is_finished()) {
                    return Err(ControlError::AlreadyRunning);
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Err(self.reject(&mut current, id, e))
            }
        }
    }

    pub fn request_stop(&self, handle: &RunHandle) {
        handle.request_stop();
    }

    pub fn status(&self, handle: &RunHandle) -> RunState {
        handle.status()
    }

    /// Stop the current run, if any. Returns immediately.
    pub fn stop(&self) {
        if let Some(run) = self.lock_current().as_ref() {
            log::info!("Stop requested for run {}", run.id());
            run.request_stop();
        }
    }

    /// Status of the most recent run, or `Idle` when none has started
    pub fn get_status(&self) -> StatusSnapshot {
        self.lock_current()
            .as_ref()
            .map(|run| run.status().summary())
            .unwrap_or_default()
    }

    /// Handle of the most recent run
    pub fn last_run(&self) -> Option<RunHandle> {
        self.lock_current().clone()
    }

    /// Record a run that failed before it could start
    fn reject(
        &self,
        current: &mut Option<RunHandle>,
        id: u64,
        error: ConfigurationError,
    ) -> ControlError {
        log::error!("Run {} rejected: {}", id, error);
        let shared = Arc::new(SharedState::failed(FailureReason::Configuration {
            message: error.to_string(),
        }));
        *current = Some(RunHandle::new(id, shared, None));
        ControlError::Configuration(error)
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<RunHandle>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
