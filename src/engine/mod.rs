//! Automation engine
//!
//! Step definitions, step graphs, the sequential drive loop, and the run
//! controller that puts each run on its own worker thread.

pub mod clock;
pub mod controller;
pub mod graph;
pub mod sequencer;
pub mod state;
pub mod step;

pub use clock::{Clock, SystemClock};
pub use controller::{ControlError, RunController, RunHandle};
pub use graph::{StepGraph, Target};
pub use sequencer::{RunOutcome, Sequencer};
pub use state::{
    AttemptFailure, CancelToken, FailureReason, LastMatch, RunState, RunStatus, SharedState,
    StatusSnapshot,
};
pub use step::{Action, Branch, DecisionPolicy, RetryLimit, Step, Transition};
