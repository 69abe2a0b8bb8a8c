//! Declarative step definitions
//!
//! A `Step` is one perceive-decide-act-wait unit. Steps are plain data: the
//! sequencer keeps no per-step state beyond which step is current and how
//! many attempts it has made.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ports::Point;

/// How a step chooses among its candidate patterns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPolicy {
    /// Act on the first candidate, in order, that clears the threshold
    #[default]
    FirstMatch,
    /// Act on the highest-confidence candidate (mutually exclusive states)
    BestOf,
    /// Every candidate must be present in the same frame; act on the last
    RequireAll,
}

/// How many attempts a step may make before following `on_failure`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryLimit {
    Attempts(u32),
    /// Open-ended wait; only a timeout or a stop request ends it
    Unbounded,
}

impl Default for RetryLimit {
    fn default() -> Self {
        RetryLimit::Attempts(1)
    }
}

impl RetryLimit {
    /// Whether another attempt is allowed after `attempts_made` failures
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        match self {
            RetryLimit::Attempts(limit) => attempts_made < (*limit).max(1),
            RetryLimit::Unbounded => true,
        }
    }
}

/// Input performed when a step matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Observe only
    None,
    /// Tap the matched center, shifted by `offset`
    Tap {
        #[serde(default)]
        offset: Point,
        #[serde(default = "default_press_ms")]
        duration_ms: u64,
        #[serde(default = "default_repeat")]
        repeat: u32,
        #[serde(default)]
        interval_ms: u64,
    },
    /// Swipe along `path`; with `relative`, points are offsets from the
    /// matched center
    Swipe {
        path: Vec<Point>,
        #[serde(default = "default_swipe_ms")]
        duration_ms: u64,
        #[serde(default)]
        relative: bool,
    },
}

fn default_press_ms() -> u64 {
    100
}

fn default_repeat() -> u32 {
    1
}

fn default_swipe_ms() -> u64 {
    500
}

impl Default for Action {
    fn default() -> Self {
        Action::tap()
    }
}

impl Action {
    /// Single tap on the matched center
    pub fn tap() -> Self {
        Action::Tap {
            offset: Point::default(),
            duration_ms: default_press_ms(),
            repeat: 1,
            interval_ms: 0,
        }
    }

    /// `count` taps, `interval` apart
    pub fn tap_repeated(count: u32, interval: Duration) -> Self {
        Action::Tap {
            offset: Point::default(),
            duration_ms: default_press_ms(),
            repeat: count,
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Press and hold the matched center
    pub fn long_press(duration: Duration) -> Self {
        Action::Tap {
            offset: Point::default(),
            duration_ms: duration.as_millis() as u64,
            repeat: 1,
            interval_ms: 0,
        }
    }

    /// Swipe along a path relative to the matched center
    pub fn swipe_from_match(path: Vec<Point>, duration: Duration) -> Self {
        Action::Swipe {
            path,
            duration_ms: duration.as_millis() as u64,
            relative: true,
        }
    }
}

/// Where control goes after a step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Transition {
    /// The next declared step, or completion after the last one
    Next,
    Complete,
    Abort,
    Step(String),
}

impl Transition {
    pub fn next() -> Self {
        Transition::Next
    }

    pub fn abort() -> Self {
        Transition::Abort
    }

    pub fn to(id: impl Into<String>) -> Self {
        Transition::Step(id.into())
    }
}

impl From<String> for Transition {
    fn from(value: String) -> Self {
        match value.as_str() {
            "@next" => Transition::Next,
            "@complete" => Transition::Complete,
            "@abort" => Transition::Abort,
            _ => Transition::Step(value),
        }
    }
}

impl From<Transition> for String {
    fn from(value: Transition) -> Self {
        match value {
            Transition::Next => "@next".to_string(),
            Transition::Complete => "@complete".to_string(),
            Transition::Abort => "@abort".to_string(),
            Transition::Step(id) => id,
        }
    }
}

/// Per-candidate override, chosen by which pattern won
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub pattern: String,
    /// Replaces the step's action when this pattern wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Replaces `on_success` when this pattern wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Transition>,
}

/// One node of the step graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Ordered; order breaks ties and drives `first_match`
    pub candidates: Vec<String>,
    #[serde(default)]
    pub policy: DecisionPolicy,
    /// Minimum confidence; falls back to the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub pre_delay_ms: u64,
    #[serde(default)]
    pub post_delay_ms: u64,
    /// Wall-clock budget for the whole step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_limit: RetryLimit,
    #[serde(default)]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
    /// With `require_all`, search later candidates inside the first match
    #[serde(default)]
    pub nested: bool,
    /// Failure aborts the run instead of following `on_failure`
    #[serde(default)]
    pub required: bool,
    /// Disabled steps are skipped along `on_success`
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Transition::next")]
    pub on_success: Transition,
    #[serde(default = "Transition::abort")]
    pub on_failure: Transition,
}

fn default_enabled() -> bool {
    true
}

impl Step {
    /// A single-attempt tap step over `candidates`
    pub fn new<I, S>(id: impl Into<String>, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            candidates: candidates.into_iter().map(Into::into).collect(),
            policy: DecisionPolicy::default(),
            threshold: None,
            pre_delay_ms: 0,
            post_delay_ms: 0,
            timeout_ms: None,
            retry_limit: RetryLimit::default(),
            action: Action::default(),
            branches: Vec::new(),
            nested: false,
            required: false,
            enabled: true,
            on_success: Transition::Next,
            on_failure: Transition::Abort,
        }
    }

    pub fn with_policy(mut self, policy: DecisionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_retry(mut self, retry_limit: RetryLimit) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_pre_delay(mut self, delay: Duration) -> Self {
        self.pre_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_branch(mut self, branch: Branch) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn on_success(mut self, transition: Transition) -> Self {
        self.on_success = transition;
        self
    }

    pub fn on_failure(mut self, transition: Transition) -> Self {
        self.on_failure = transition;
        self
    }

    pub fn pre_delay(&self) -> Duration {
        Duration::from_millis(self.pre_delay_ms)
    }

    pub fn post_delay(&self) -> Duration {
        Duration::from_millis(self.post_delay_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Override declared for the winning pattern, if any
    pub fn branch_for(&self, pattern: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.pattern == pattern)
    }

    /// Every transition this step can take
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        [&self.on_success, &self.on_failure]
            .into_iter()
            .chain(self.branches.iter().filter_map(|b| b.next.as_ref()))
    }

    /// Every action this step can perform
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        std::iter::once(&self.action).chain(self.branches.iter().filter_map(|b| b.action.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_limit_counts() {
        let limit = RetryLimit::Attempts(3);
        assert!(limit.allows_another(1));
        assert!(limit.allows_another(2));
        assert!(!limit.allows_another(3));

        assert!(!RetryLimit::Attempts(0).allows_another(1));
        assert!(RetryLimit::Unbounded.allows_another(u32::MAX));
    }

    #[test]
    fn test_transition_strings() {
        for (text, transition) in [
            ("@next", Transition::Next),
            ("@complete", Transition::Complete),
            ("@abort", Transition::Abort),
            ("login", Transition::to("login")),
        ] {
            assert_eq!(Transition::from(text.to_string()), transition);
            assert_eq!(String::from(transition), text);
        }
    }

    #[test]
    fn test_minimal_step_json_defaults() {
        let step: Step = serde_json::from_str(r#"{ "id": "task", "candidates": ["task"] }"#).unwrap();

        assert_eq!(step.policy, DecisionPolicy::FirstMatch);
        assert_eq!(step.retry_limit, RetryLimit::Attempts(1));
        assert_eq!(step.action, Action::tap());
        assert_eq!(step.on_success, Transition::Next);
        assert_eq!(step.on_failure, Transition::Abort);
        assert!(step.enabled);
        assert!(!step.required);
    }

    #[test]
    fn test_full_step_json() {
        let json = r#"{
            "id": "speed",
            "candidates": ["speed_on", "speed_off"],
            "policy": "best_of",
            "threshold": 0.8,
            "pre_delay_ms": 10000,
            "retry_limit": { "attempts": 5 },
            "branches": [
                { "pattern": "speed_on", "action": { "type": "none" }, "next": "auto" },
                { "pattern": "speed_off", "next": "speed" }
            ],
            "on_failure": "auto"
        }"#;
        let step: Step = serde_json::from_str(json).unwrap();

        assert_eq!(step.policy, DecisionPolicy::BestOf);
        assert_eq!(step.pre_delay(), Duration::from_secs(10));
        assert_eq!(step.branch_for("speed_on").unwrap().action, Some(Action::None));
        assert_eq!(
            step.branch_for("speed_off").unwrap().next,
            Some(Transition::to("speed"))
        );
        assert!(step.branch_for("other").is_none());
        assert_eq!(step.transitions().count(), 4);
    }

    #[test]
    fn test_unbounded_and_swipe_json() {
        let json = r#"{
            "id": "scroll",
            "candidates": ["list"],
            "retry_limit": "unbounded",
            "action": { "type": "swipe", "path": [{ "x": 0, "y": 0 }, { "x": 0, "y": -300 }], "relative": true }
        }"#;
        let step: Step = serde_json::from_str(json).unwrap();

        assert_eq!(step.retry_limit, RetryLimit::Unbounded);
        assert_eq!(
            step.action,
            Action::swipe_from_match(
                vec![Point::new(0, 0), Point::new(0, -300)],
                Duration::from_millis(500)
            )
        );
    }

    #[test]
    fn test_builder() {
        let step = Step::new("plus", ["jiahao"])
            .with_action(Action::tap_repeated(5, Duration::from_millis(500)))
            .with_post_delay(Duration::from_secs(1))
            .required();

        assert!(step.required);
        assert_eq!(step.post_delay(), Duration::from_secs(1));
        assert!(matches!(
            step.action,
            Action::Tap { repeat: 5, interval_ms: 500, .. }
        ));
        assert_eq!(step.actions().count(), 1);
    }
}
