//! Step graph drive loop
//!
//! Walks a validated step graph one step at a time. Each attempt waits the
//! pre-action delay, captures a fresh frame, applies the step's decision
//! policy, acts on the winner and waits the post-action delay. Failed
//! attempts are retried after the poll interval until the retry limit or the
//! step's timeout runs out.
//!
//! Waits are the only suspension points and are sliced so that a stop
//! request is honored within one `cancel_check` interval.

use std::sync::Arc;
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use super::graph::{StepGraph, Target};
use super::state::{
    AttemptFailure, CancelToken, FailureReason, LastMatch, RunState, RunStatus, SharedState,
};
use super::step::{Action, DecisionPolicy, Step, Transition};
use crate::config::{ConfigurationError, EngineSettings};
use crate::ports::{ActionPort, FrameSource, Point};
use crate::vision::{Frame, MatchResult, Matcher, PatternLibrary};

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Aborted(FailureReason),
    Cancelled,
}

impl RunOutcome {
    /// Terminal status reported for this outcome
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Aborted(_) => RunStatus::Failed,
            RunOutcome::Cancelled => RunStatus::Stopped,
        }
    }
}

/// Anything that ends a step early
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Fatal(FailureReason),
}

enum StepOutcome {
    Succeeded(Transition),
    Failed(FailureReason),
}

enum Attempt {
    Succeeded(MatchResult),
    Failed(AttemptFailure),
}

/// Runs one step graph to completion
pub struct Sequencer {
    graph: StepGraph,
    library: Arc<PatternLibrary>,
    source: Arc<dyn FrameSource>,
    port: Arc<dyn ActionPort>,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    shared: Arc<SharedState>,
    cancel: CancelToken,
}

impl Sequencer {
    /// Validate `graph` against `library` and prepare a run
    pub fn new(
        graph: StepGraph,
        library: Arc<PatternLibrary>,
        source: Arc<dyn FrameSource>,
        port: Arc<dyn ActionPort>,
        settings: EngineSettings,
    ) -> Result<Self, ConfigurationError> {
        settings.check()?;
        graph.validate(&library)?;

        let shared = Arc::new(SharedState::new());
        let cancel = shared.cancel_token();

        Ok(Self {
            graph,
            library,
            source,
            port,
            settings,
            clock: Arc::new(SystemClock::new()),
            shared,
            cancel,
        })
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    /// Token that stops this run at its next checkpoint
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current run state snapshot
    pub fn state(&self) -> RunState {
        self.shared.snapshot()
    }

    pub(crate) fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Drive the graph from its entry step until a terminal state
    pub fn run(&self) -> RunOutcome {
        let name = self.graph.name.as_deref().unwrap_or("unnamed");
        log::info!(
            "Starting run '{}' ({} steps)",
            name,
            self.graph.steps.len()
        );
        self.shared.update(|s| {
            s.status = RunStatus::Running;
            s.failure = None;
        });

        let outcome = self.drive();

        match &outcome {
            RunOutcome::Completed => log::info!("Run '{}' completed", name),
            RunOutcome::Cancelled => log::info!("Run '{}' stopped", name),
            RunOutcome::Aborted(reason) => {
                log::error!("Run '{}' aborted: {}", name, reason.code())
            }
        }

        self.shared.update(|s| {
            s.status = outcome.status();
            if let RunOutcome::Aborted(reason) = &outcome {
                s.failure = Some(reason.clone());
            }
        });

        outcome
    }

    fn drive(&self) -> RunOutcome {
        let Some(mut index) = self.graph.entry_index() else {
            return RunOutcome::Aborted(FailureReason::Configuration {
                message: ConfigurationError::EmptyGraph.to_string(),
            });
        };

        loop {
            if self.cancel.is_cancelled() {
                return RunOutcome::Cancelled;
            }

            let step = &self.graph.steps[index];
            let (transition, failure) = match self.run_step(step) {
                Ok(StepOutcome::Succeeded(next)) => (next, None),
                Ok(StepOutcome::Failed(reason)) if step.required => {
                    log::error!("Required step '{}' failed: {}", step.id, reason.code());
                    return RunOutcome::Aborted(reason);
                }
                Ok(StepOutcome::Failed(reason)) => {
                    log::warn!(
                        "Step '{}' failed ({}), following {}",
                        step.id,
                        reason.code(),
                        String::from(step.on_failure.clone())
                    );
                    (step.on_failure.clone(), Some(reason))
                }
                Err(Interrupt::Cancelled) => return RunOutcome::Cancelled,
                Err(Interrupt::Fatal(reason)) => return RunOutcome::Aborted(reason),
            };

            match self.graph.resolve(index, &transition) {
                Some(Target::Step(next)) => index = next,
                Some(Target::Completed) => return RunOutcome::Completed,
                Some(Target::Aborted) => {
                    return RunOutcome::Aborted(failure.unwrap_or(FailureReason::AbortEdge {
                        step: step.id.clone(),
                    }))
                }
                None => {
                    return RunOutcome::Aborted(FailureReason::Configuration {
                        message: format!(
                            "Step '{}' references unknown step '{}'",
                            step.id,
                            String::from(transition)
                        ),
                    })
                }
            }
        }
    }

    fn run_step(&self, step: &Step) -> Result<StepOutcome, Interrupt> {
        self.shared.update(|s| {
            s.current_step_id = Some(step.id.clone());
            s.attempt_count = 0;
        });

        if !step.enabled {
            log::info!("Step '{}' disabled, skipping", step.id);
            self.shared.update(|s| s.steps_completed += 1);
            return Ok(StepOutcome::Succeeded(step.on_success.clone()));
        }

        log::info!("Entering step '{}'", step.id);
        let threshold = step.threshold.unwrap_or(self.settings.default_threshold);
        let started = self.clock.now();
        let mut attempts: u32 = 0;

        loop {
            if let Some(timeout) = step.timeout() {
                if self.clock.now().saturating_sub(started) >= timeout {
                    log::warn!(
                        "Step '{}' timed out after {:?} ({} attempts)",
                        step.id,
                        timeout,
                        attempts
                    );
                    return Ok(StepOutcome::Failed(FailureReason::Timeout {
                        step: step.id.clone(),
                    }));
                }
            }

            match self.attempt(step, threshold)? {
                Attempt::Succeeded(found) => {
                    log::info!(
                        "Step '{}' matched '{}' ({:.3})",
                        step.id,
                        found.pattern_name,
                        found.confidence
                    );
                    let next = step
                        .branch_for(&found.pattern_name)
                        .and_then(|b| b.next.clone())
                        .unwrap_or_else(|| step.on_success.clone());

                    self.shared.update(|s| {
                        s.attempt_count = 0;
                        s.steps_completed += 1;
                        s.last_match = Some(LastMatch {
                            step: step.id.clone(),
                            pattern: found.pattern_name,
                            confidence: found.confidence,
                        });
                    });
                    return Ok(StepOutcome::Succeeded(next));
                }
                Attempt::Failed(failure) => {
                    attempts = attempts.saturating_add(1);
                    self.shared.update(|s| s.attempt_count = attempts);
                    log::debug!(
                        "Step '{}' attempt {} failed: {}",
                        step.id,
                        attempts,
                        failure.code()
                    );

                    let every = self.settings.progress_log_every;
                    if every > 0 && attempts % every == 0 {
                        log::info!("Still waiting on step '{}' ({} attempts)", step.id, attempts);
                    }

                    if !step.retry_limit.allows_another(attempts) {
                        return Ok(StepOutcome::Failed(FailureReason::RetriesExhausted {
                            step: step.id.clone(),
                            attempts,
                            last: failure,
                        }));
                    }

                    self.wait(self.settings.poll_interval())?;
                }
            }
        }
    }

    fn attempt(&self, step: &Step, threshold: f32) -> Result<Attempt, Interrupt> {
        self.wait(step.pre_delay())?;

        let frame = match self.source.capture_frame() {
            Ok(frame) => frame,
            Err(error) => {
                log::warn!("Capture failed on step '{}': {}", step.id, error);
                return Ok(Attempt::Failed(AttemptFailure::Capture { error }));
            }
        };

        let Some(found) = self.decide(step, &frame, threshold)? else {
            return Ok(Attempt::Failed(AttemptFailure::NoMatch));
        };

        let action = step
            .branch_for(&found.pattern_name)
            .and_then(|b| b.action.as_ref())
            .unwrap_or(&step.action);

        if !self.perform(action, &found)? {
            log::warn!("Action for step '{}' was not delivered", step.id);
            return Ok(Attempt::Failed(AttemptFailure::Action));
        }

        self.wait(step.post_delay())?;
        Ok(Attempt::Succeeded(found))
    }

    /// Apply the step's decision policy to one frame
    fn decide(
        &self,
        step: &Step,
        frame: &Frame,
        threshold: f32,
    ) -> Result<Option<MatchResult>, Interrupt> {
        let matcher = Matcher::new(&self.library);
        let candidates = step.candidates.as_slice();

        let decided = match step.policy {
            DecisionPolicy::FirstMatch => matcher.match_first(frame, candidates, threshold),
            DecisionPolicy::BestOf => matcher.match_best_of(frame, candidates, threshold),
            DecisionPolicy::RequireAll => matcher
                .match_all(frame, candidates, threshold, step.nested)
                .map(|all| all.and_then(|mut matches| matches.pop())),
        };

        decided.map_err(|e| {
            log::error!("Step '{}' cannot be evaluated: {}", step.id, e);
            Interrupt::Fatal(FailureReason::Configuration {
                message: e.to_string(),
            })
        })
    }

    fn perform(&self, action: &Action, found: &MatchResult) -> Result<bool, Interrupt> {
        match action {
            Action::None => Ok(true),
            Action::Tap {
                offset,
                duration_ms,
                repeat,
                interval_ms,
            } => {
                let point = found.center.offset(offset.x, offset.y);
                let duration = Duration::from_millis(*duration_ms);
                let repeat = (*repeat).max(1);

                for i in 0..repeat {
                    if i > 0 {
                        self.wait(Duration::from_millis(*interval_ms))?;
                    }
                    log::debug!("Tap {} ({}/{})", point, i + 1, repeat);
                    if !self.port.tap(point, duration) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Action::Swipe {
                path,
                duration_ms,
                relative,
            } => {
                let path: Vec<Point> = if *relative {
                    path.iter()
                        .map(|p| found.center.offset(p.x, p.y))
                        .collect()
                } else {
                    path.clone()
                };
                log::debug!("Swipe over {} points", path.len());
                Ok(self.port.swipe(&path, Duration::from_millis(*duration_ms)))
            }
        }
    }

    /// Sleep in `cancel_check` slices, checking for a stop request before
    /// and after each one
    fn wait(&self, duration: Duration) -> Result<(), Interrupt> {
        let slice = self.settings.cancel_check();
        let mut remaining = duration;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            if remaining.is_zero() {
                return Ok(());
            }
            let chunk = remaining.min(slice);
            self.clock.sleep(chunk);
            remaining -= chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::step::{Branch, RetryLimit};
    use crate::ports::CaptureError;
    use crate::testing::{noise, scene, ManualClock, RecordingPort, ScriptedSource};
    use image::RgbImage;

    fn library() -> Arc<PatternLibrary> {
        Arc::new(PatternLibrary::from_images([
            ("a", noise(12, 12, 1)),
            ("b", noise(12, 12, 2)),
            ("speed_on", noise(12, 12, 4)),
            ("speed_off", noise(12, 12, 5)),
        ]))
    }

    /// Frame showing pattern "a" centered at (26, 16)
    fn frame_a() -> Frame {
        scene(64, 48, &[(&noise(12, 12, 1), 20, 10)])
    }

    fn empty_frame() -> Frame {
        scene(64, 48, &[])
    }

    struct Rig {
        source: Arc<ScriptedSource>,
        port: Arc<RecordingPort>,
        clock: ManualClock,
    }

    impl Rig {
        fn new(frames: Vec<Result<Frame, CaptureError>>) -> Self {
            Self::with_port(frames, RecordingPort::new())
        }

        fn with_port(frames: Vec<Result<Frame, CaptureError>>, port: RecordingPort) -> Self {
            Self {
                source: Arc::new(ScriptedSource::new(frames)),
                port: Arc::new(port),
                clock: ManualClock::new(),
            }
        }

        fn sequencer(&self, graph: StepGraph, library: Arc<PatternLibrary>) -> Sequencer {
            Sequencer::new(
                graph,
                library,
                self.source.clone(),
                self.port.clone(),
                EngineSettings::default(),
            )
            .unwrap()
            .with_clock(self.clock.clone())
        }
    }

    #[test]
    fn test_single_step_completes() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let seq = rig.sequencer(StepGraph::new(vec![Step::new("tap_a", ["a"])]), library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(rig.port.taps(), vec![Point::new(26, 16)]);

        let state = seq.state();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.steps_completed, 1);
        assert_eq!(state.last_match.unwrap().pattern, "a");
    }

    #[test]
    fn test_retry_limit_makes_exact_attempts() {
        let rig = Rig::new(vec![Ok(empty_frame())]);
        let graph = StepGraph::new(vec![
            Step::new("wait_b", ["b"]).with_retry(RetryLimit::Attempts(3))
        ]);
        let seq = rig.sequencer(graph, library());

        let outcome = seq.run();
        assert_eq!(
            outcome,
            RunOutcome::Aborted(FailureReason::RetriesExhausted {
                step: "wait_b".to_string(),
                attempts: 3,
                last: AttemptFailure::NoMatch,
            })
        );
        assert_eq!(rig.source.captures(), 3);
        assert_eq!(rig.clock.elapsed(), Duration::from_secs(2));
        assert!(rig.port.taps().is_empty());
        assert_eq!(seq.state().summary().reason.as_deref(), Some("retries_exhausted"));
    }

    #[test]
    fn test_optional_step_follows_failure_edge() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let graph = StepGraph::new(vec![
            Step::new("wait_b", ["b"])
                .with_retry(RetryLimit::Attempts(2))
                .on_failure(Transition::to("fallback")),
            Step::new("never", ["b"]),
            Step::new("fallback", ["a"]).on_success(Transition::Complete),
        ]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(rig.source.captures(), 3);
        assert_eq!(rig.port.taps(), vec![Point::new(26, 16)]);
    }

    #[test]
    fn test_capture_failures_are_retried() {
        let rig = Rig::new(vec![
            Err(CaptureError::Unavailable),
            Err(CaptureError::TimedOut),
            Err(CaptureError::Unavailable),
            Ok(frame_a()),
        ]);
        let graph = StepGraph::new(vec![
            Step::new("tap_a", ["a"]).with_retry(RetryLimit::Attempts(5))
        ]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(rig.source.captures(), 4);
        assert_eq!(rig.port.taps().len(), 1);
        assert_eq!(seq.state().attempt_count, 0);
    }

    #[test]
    fn test_required_step_times_out() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let graph = StepGraph::new(vec![Step::new("wait_b", ["b"])
            .with_retry(RetryLimit::Unbounded)
            .with_timeout(Duration::from_secs(10))
            .required()]);
        let seq = rig.sequencer(graph, library());

        let outcome = seq.run();
        assert_eq!(
            outcome,
            RunOutcome::Aborted(FailureReason::Timeout {
                step: "wait_b".to_string()
            })
        );

        let elapsed = rig.clock.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed <= Duration::from_secs(11));

        let status = seq.state().summary();
        assert_eq!(status.state, RunStatus::Failed);
        assert_eq!(status.reason.as_deref(), Some("timeout"));
        assert_eq!(status.current_step_id.as_deref(), Some("wait_b"));
    }

    #[test]
    fn test_required_step_ignores_failure_edge() {
        let rig = Rig::new(vec![Ok(empty_frame())]);
        let graph = StepGraph::new(vec![
            Step::new("wait_b", ["b"])
                .required()
                .on_failure(Transition::to("other")),
            Step::new("other", ["a"]),
        ]);
        let seq = rig.sequencer(graph, library());

        assert!(matches!(
            seq.run(),
            RunOutcome::Aborted(FailureReason::RetriesExhausted { attempts: 1, .. })
        ));
        assert_eq!(rig.source.captures(), 1);
    }

    #[test]
    fn test_best_of_acts_on_present_pattern() {
        let frame = scene(64, 48, &[(&noise(12, 12, 2), 40, 30)]);
        let rig = Rig::new(vec![Ok(frame)]);
        let graph = StepGraph::new(vec![
            Step::new("pick", ["a", "b"]).with_policy(DecisionPolicy::BestOf)
        ]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(rig.port.taps(), vec![Point::new(46, 36)]);
    }

    #[test]
    fn test_branch_on_toggle_skin() {
        let off = scene(64, 48, &[(&noise(12, 12, 5), 4, 4)]);
        let on = scene(64, 48, &[(&noise(12, 12, 4), 4, 4)]);
        let rig = Rig::new(vec![Ok(off), Ok(on)]);

        let graph = StepGraph::new(vec![
            Step::new("speed", ["speed_on", "speed_off"])
                .with_policy(DecisionPolicy::BestOf)
                .with_branch(Branch {
                    pattern: "speed_on".to_string(),
                    action: Some(Action::None),
                    next: Some(Transition::to("confirm")),
                })
                .with_branch(Branch {
                    pattern: "speed_off".to_string(),
                    action: None,
                    next: Some(Transition::to("speed")),
                }),
            Step::new("confirm", ["speed_on"]).with_action(Action::None),
        ]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        // Only the "off" skin is tapped; the "on" skin is left alone
        assert_eq!(rig.port.taps(), vec![Point::new(10, 10)]);
        assert_eq!(rig.source.captures(), 3);
        assert_eq!(seq.state().steps_completed, 3);
    }

    #[test]
    fn test_disabled_step_is_skipped() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let graph = StepGraph::new(vec![
            Step::new("commission", ["not_loaded"]).disabled(),
            Step::new("tap_a", ["a"]),
        ]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(rig.source.captures(), 1);
        assert_eq!(seq.state().steps_completed, 2);
    }

    #[test]
    fn test_require_all_nested_acts_on_inner_control() {
        let mut panel = noise(30, 30, 7);
        image::imageops::replace(&mut panel, &noise(12, 12, 2), 9, 9);
        let library = Arc::new(PatternLibrary::from_images([
            ("panel", panel.clone()),
            ("button", noise(12, 12, 2)),
        ]));

        let rig = Rig::new(vec![Ok(scene(80, 60, &[(&panel, 40, 20)]))]);
        let graph = StepGraph::new(vec![Step::new("confirm", ["panel", "button"])
            .with_policy(DecisionPolicy::RequireAll)
            .nested()]);
        let seq = rig.sequencer(graph, library);

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(rig.port.taps(), vec![Point::new(55, 35)]);
    }

    #[test]
    fn test_repeated_taps_wait_between_presses() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let graph = StepGraph::new(vec![Step::new("plus", ["a"])
            .with_action(Action::tap_repeated(5, Duration::from_millis(500)))]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(rig.port.taps(), vec![Point::new(26, 16); 5]);
        assert_eq!(rig.clock.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_tap_offset_and_long_press() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let graph = StepGraph::new(vec![Step::new("hold", ["a"]).with_action(Action::Tap {
            offset: Point::new(5, -3),
            duration_ms: 800,
            repeat: 1,
            interval_ms: 0,
        })]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(
            rig.port.presses(),
            vec![(Point::new(31, 13), Duration::from_millis(800))]
        );
    }

    #[test]
    fn test_relative_swipe_from_match() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let graph = StepGraph::new(vec![Step::new("scroll", ["a"]).with_action(
            Action::swipe_from_match(
                vec![Point::new(0, 0), Point::new(0, -10)],
                Duration::from_millis(300),
            ),
        )]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(
            rig.port.swipes(),
            vec![vec![Point::new(26, 16), Point::new(26, 6)]]
        );
    }

    #[test]
    fn test_action_failure_is_retried_then_fails() {
        let rig = Rig::with_port(vec![Ok(frame_a())], RecordingPort::failing());
        let graph = StepGraph::new(vec![
            Step::new("tap_a", ["a"]).with_retry(RetryLimit::Attempts(2))
        ]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(
            seq.run(),
            RunOutcome::Aborted(FailureReason::RetriesExhausted {
                step: "tap_a".to_string(),
                attempts: 2,
                last: AttemptFailure::Action,
            })
        );
        assert_eq!(rig.port.taps().len(), 2);
    }

    #[test]
    fn test_success_edge_to_abort() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let graph = StepGraph::new(vec![
            Step::new("error_dialog", ["a"]).on_success(Transition::Abort)
        ]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(
            seq.run(),
            RunOutcome::Aborted(FailureReason::AbortEdge {
                step: "error_dialog".to_string()
            })
        );
    }

    #[test]
    fn test_unbounded_poll_until_match() {
        let mut frames: Vec<Result<Frame, CaptureError>> =
            (0..12).map(|_| Ok(empty_frame())).collect();
        frames.push(Ok(frame_a()));
        let rig = Rig::new(frames);
        let graph = StepGraph::new(vec![
            Step::new("wait_a", ["a"]).with_retry(RetryLimit::Unbounded)
        ]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(rig.source.captures(), 13);
        assert_eq!(rig.clock.elapsed(), Duration::from_secs(12));
        assert_eq!(seq.state().attempt_count, 0);
    }

    #[test]
    fn test_pattern_larger_than_frame_aborts() {
        let library = Arc::new(PatternLibrary::from_images([("huge", noise(80, 80, 3))]));
        let rig = Rig::new(vec![Ok(frame_a())]);
        let seq = rig.sequencer(StepGraph::new(vec![Step::new("huge", ["huge"])]), library);

        assert!(matches!(
            seq.run(),
            RunOutcome::Aborted(FailureReason::Configuration { .. })
        ));
        assert_eq!(seq.state().summary().reason.as_deref(), Some("configuration"));
    }

    #[test]
    fn test_missing_pattern_rejected_before_run() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let result = Sequencer::new(
            StepGraph::new(vec![Step::new("x", ["not_there"])]),
            library(),
            rig.source.clone(),
            rig.port.clone(),
            EngineSettings::default(),
        );

        assert!(matches!(result, Err(ConfigurationError::MissingPatterns(_))));
        assert_eq!(rig.source.captures(), 0);
    }

    #[test]
    fn test_cancelled_before_start() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let seq = rig.sequencer(StepGraph::new(vec![Step::new("tap_a", ["a"])]), library());

        seq.cancel_token().cancel();
        assert_eq!(seq.run(), RunOutcome::Cancelled);
        assert_eq!(rig.source.captures(), 0);
        assert_eq!(seq.state().status, RunStatus::Stopped);
    }

    #[test]
    fn test_pre_delay_waits_before_capture() {
        let rig = Rig::new(vec![Ok(frame_a())]);
        let graph = StepGraph::new(vec![Step::new("tap_a", ["a"])
            .with_pre_delay(Duration::from_millis(1500))
            .with_post_delay(Duration::from_millis(250))]);
        let seq = rig.sequencer(graph, library());

        assert_eq!(seq.run(), RunOutcome::Completed);
        assert_eq!(rig.clock.elapsed(), Duration::from_millis(1750));
    }

    #[test]
    fn test_exported_graph_behaves_identically() {
        let graph = StepGraph::new(vec![
            Step::new("pick", ["a", "b"])
                .with_policy(DecisionPolicy::BestOf)
                .with_retry(RetryLimit::Attempts(4))
                .with_action(Action::tap_repeated(2, Duration::from_millis(100))),
            Step::new("then_b", ["b"])
                .with_retry(RetryLimit::Attempts(2))
                .on_failure(Transition::Complete),
        ])
        .with_name("round_trip");
        let imported = StepGraph::from_json(&graph.to_json().unwrap()).unwrap();

        let frames = || vec![Ok(empty_frame()), Ok(frame_a())];
        let exported_rig = Rig::new(frames());
        let imported_rig = Rig::new(frames());

        let exported = exported_rig.sequencer(graph, library()).run();
        let replayed = imported_rig.sequencer(imported, library()).run();

        assert_eq!(exported, replayed);
        assert_eq!(exported_rig.port.presses(), imported_rig.port.presses());
        assert_eq!(exported_rig.source.captures(), imported_rig.source.captures());
        assert_eq!(exported_rig.clock.elapsed(), imported_rig.clock.elapsed());
    }

    #[test]
    fn test_blank_frame_never_matches() {
        let blank = Frame::new(RgbImage::from_pixel(64, 48, image::Rgb([0, 0, 0])));
        let rig = Rig::new(vec![Ok(blank)]);
        let seq = rig.sequencer(StepGraph::new(vec![Step::new("tap_a", ["a"])]), library());

        assert!(matches!(
            seq.run(),
            RunOutcome::Aborted(FailureReason::RetriesExhausted {
                last: AttemptFailure::NoMatch,
                ..
            })
        ));
    }
}
