//! Step graphs
//!
//! A step graph is the business flow expressed as data: an ordered list of
//! steps with success/failure edges. Graphs are validated against the pattern
//! library before a run starts, so a missing pattern or dangling edge is a
//! startup error rather than a stall in the middle of a run.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::step::{Action, Step, Transition};
use crate::config::ConfigurationError;
use crate::vision::PatternLibrary;

/// Resolved destination of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Step(usize),
    Completed,
    Aborted,
}

/// A declarative automation flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepGraph {
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Entry step id; the first declared step when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    pub steps: Vec<Step>,
}

impl StepGraph {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            name: None,
            entry: None,
            steps,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    /// Parse a graph definition
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let graph: Self = serde_json::from_str(json)?;
        graph.validate_structure()?;
        Ok(graph)
    }

    /// Read a graph definition from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Export the definition
    pub fn to_json(&self) -> Result<String, ConfigurationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Index of the entry step
    pub fn entry_index(&self) -> Option<usize> {
        match &self.entry {
            Some(id) => self.index_of(id),
            None => (!self.steps.is_empty()).then_some(0),
        }
    }

    /// Every pattern any enabled step may look for, deduplicated and sorted
    pub fn required_patterns(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.enabled)
            .flat_map(|s| s.candidates.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Resolve a transition taken from the step at `from`
    pub fn resolve(&self, from: usize, transition: &Transition) -> Option<Target> {
        match transition {
            Transition::Next if from + 1 < self.steps.len() => Some(Target::Step(from + 1)),
            Transition::Next | Transition::Complete => Some(Target::Completed),
            Transition::Abort => Some(Target::Aborted),
            Transition::Step(id) => self.index_of(id).map(Target::Step),
        }
    }

    /// Check the graph on its own: ids, edges, candidates, thresholds
    pub fn validate_structure(&self) -> Result<(), ConfigurationError> {
        if self.steps.is_empty() {
            return Err(ConfigurationError::EmptyGraph);
        }

        if let Some(entry) = &self.entry {
            if self.index_of(entry).is_none() {
                return Err(ConfigurationError::UnknownEntry(entry.clone()));
            }
        }

        let mut seen = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ConfigurationError::DuplicateStep(step.id.clone()));
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.candidates.is_empty() {
                return Err(ConfigurationError::EmptyCandidates(step.id.clone()));
            }

            if let Some(threshold) = step.threshold {
                if !(0.0..1.0).contains(&threshold) {
                    return Err(ConfigurationError::InvalidThreshold {
                        step: step.id.clone(),
                        threshold,
                    });
                }
            }

            for branch in &step.branches {
                if !step.candidates.contains(&branch.pattern) {
                    return Err(ConfigurationError::UnknownBranch {
                        step: step.id.clone(),
                        pattern: branch.pattern.clone(),
                    });
                }
            }

            for transition in step.transitions() {
                if self.resolve(index, transition).is_none() {
                    return Err(ConfigurationError::UnknownStep {
                        step: step.id.clone(),
                        target: String::from(transition.clone()),
                    });
                }
            }

            for action in step.actions() {
                if let Action::Swipe { path, .. } = action {
                    if path.len() < 2 {
                        return Err(ConfigurationError::ShortSwipe {
                            step: step.id.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Full startup check: structure plus every pattern present and usable
    pub fn validate(&self, library: &PatternLibrary) -> Result<(), ConfigurationError> {
        self.validate_structure()?;

        let required = self.required_patterns();
        library.ensure_present(required.as_slice())?;

        for name in &required {
            if library.get(name)?.is_flat() {
                return Err(ConfigurationError::FlatPattern(name.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::step::{Branch, DecisionPolicy, RetryLimit};
    use crate::testing::noise;

    fn linear() -> StepGraph {
        StepGraph::new(vec![
            Step::new("login", ["login_button"]).with_retry(RetryLimit::Unbounded),
            Step::new("task", ["task"]).on_failure(Transition::to("login")),
            Step::new("close", ["close"]),
        ])
    }

    #[test]
    fn test_resolve_edges() {
        let graph = linear();

        assert_eq!(graph.entry_index(), Some(0));
        assert_eq!(graph.resolve(0, &Transition::Next), Some(Target::Step(1)));
        assert_eq!(graph.resolve(2, &Transition::Next), Some(Target::Completed));
        assert_eq!(graph.resolve(1, &Transition::to("login")), Some(Target::Step(0)));
        assert_eq!(graph.resolve(1, &Transition::to("task")), Some(Target::Step(1)));
        assert_eq!(graph.resolve(1, &Transition::Abort), Some(Target::Aborted));
        assert_eq!(graph.resolve(1, &Transition::to("nowhere")), None);
    }

    #[test]
    fn test_entry_override() {
        let graph = linear().with_entry("task");
        assert_eq!(graph.entry_index(), Some(1));
        assert!(graph.validate_structure().is_ok());

        let graph = linear().with_entry("missing");
        assert!(matches!(
            graph.validate_structure(),
            Err(ConfigurationError::UnknownEntry(_))
        ));
    }

    #[test]
    fn test_structure_errors() {
        assert!(matches!(
            StepGraph::new(vec![]).validate_structure(),
            Err(ConfigurationError::EmptyGraph)
        ));

        let dup = StepGraph::new(vec![Step::new("a", ["x"]), Step::new("a", ["y"])]);
        assert!(matches!(
            dup.validate_structure(),
            Err(ConfigurationError::DuplicateStep(id)) if id == "a"
        ));

        let empty = StepGraph::new(vec![Step::new("a", Vec::<String>::new())]);
        assert!(matches!(
            empty.validate_structure(),
            Err(ConfigurationError::EmptyCandidates(_))
        ));

        let dangling = StepGraph::new(vec![Step::new("a", ["x"]).on_success(Transition::to("b"))]);
        assert!(matches!(
            dangling.validate_structure(),
            Err(ConfigurationError::UnknownStep { target, .. }) if target == "b"
        ));

        let threshold = StepGraph::new(vec![Step::new("a", ["x"]).with_threshold(1.2)]);
        assert!(matches!(
            threshold.validate_structure(),
            Err(ConfigurationError::InvalidThreshold { .. })
        ));

        let branch = StepGraph::new(vec![Step::new("a", ["x"]).with_branch(Branch {
            pattern: "y".to_string(),
            action: None,
            next: None,
        })]);
        assert!(matches!(
            branch.validate_structure(),
            Err(ConfigurationError::UnknownBranch { .. })
        ));

        let swipe = StepGraph::new(vec![Step::new("a", ["x"]).with_action(Action::Swipe {
            path: vec![],
            duration_ms: 300,
            relative: false,
        })]);
        assert!(matches!(
            swipe.validate_structure(),
            Err(ConfigurationError::ShortSwipe { .. })
        ));
    }

    #[test]
    fn test_validate_against_library() {
        let graph = linear().with_entry("login");
        let library = PatternLibrary::from_images([
            ("login_button", noise(8, 8, 1)),
            ("task", noise(8, 8, 2)),
        ]);

        match graph.validate(&library) {
            Err(ConfigurationError::MissingPatterns(names)) => {
                assert_eq!(names, vec!["close".to_string()]);
            }
            other => panic!("expected missing patterns, got {other:?}"),
        }
    }

    #[test]
    fn test_disabled_steps_do_not_require_patterns() {
        let graph = StepGraph::new(vec![
            Step::new("a", ["x"]),
            Step::new("b", ["optional_only"]).disabled(),
        ]);

        assert_eq!(graph.required_patterns(), vec!["x".to_string()]);
    }

    #[test]
    fn test_flat_pattern_rejected_at_startup() {
        let graph = StepGraph::new(vec![Step::new("a", ["flat"])]);
        let library = PatternLibrary::from_images([(
            "flat",
            image::RgbImage::from_pixel(4, 4, image::Rgb([7, 7, 7])),
        )]);

        assert!(matches!(
            graph.validate(&library),
            Err(ConfigurationError::FlatPattern(_))
        ));
    }

    #[test]
    fn test_export_import_identical() {
        let mut graph = linear().with_name("daily").with_entry("login");
        graph.steps[1] = graph.steps[1]
            .clone()
            .with_policy(DecisionPolicy::BestOf)
            .with_threshold(0.8)
            .with_branch(Branch {
                pattern: "task".to_string(),
                action: Some(Action::None),
                next: Some(Transition::Complete),
            });

        let json = graph.to_json().unwrap();
        let imported = StepGraph::from_json(&json).unwrap();
        assert_eq!(imported, graph);
        assert_eq!(imported.to_json().unwrap(), json);
    }

    #[test]
    fn test_malformed_definition() {
        assert!(matches!(
            StepGraph::from_json("{ \"steps\": 3 }"),
            Err(ConfigurationError::Malformed(_))
        ));
    }

    #[test]
    fn test_bundled_demo_graph_is_well_formed() {
        let graph =
            StepGraph::from_json(include_str!("../../demos/daily_commission.json")).unwrap();

        assert!(graph.steps.len() > 5);
        assert!(graph.steps.iter().any(|s| s.required));
        assert!(graph.required_patterns().contains(&"task".to_string()));
    }
}
