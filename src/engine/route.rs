//! Route and step definitions.
//!
//! A route is a named, ordered list of steps fixed at startup. Step behavior
//! is a tagged variant over the five supported action kinds; compute steps
//! carry their mapping as a closure over the current body.

use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineResult;

/// Input handed to a compute step.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub exchange_id: &'a str,
    pub route_id: &'a str,
    /// Current exchange body.
    pub body: &'a str,
}

/// Pure mapping of the current body.
pub type TransformFn = Arc<dyn Fn(&StepInput<'_>) -> EngineResult<String> + Send + Sync>;

/// The five supported step behaviors.
#[derive(Clone)]
pub enum StepAction {
    /// Side-effect-free mapping of the current body.
    Transform(TransformFn),
    /// Append an audit line to the route log.
    AuditLog,
    /// Call the LLM with the current body; the response becomes the body.
    LlmChat { streaming: bool },
    /// Suspend until an operator decides, up to `timeout`.
    ApprovalGate { timeout: Duration },
    /// Bump the route's success counter.
    MetricUpdate,
}

impl StepAction {
    /// Short label for logs and the routes API.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transform(_) => "transform",
            Self::AuditLog => "audit-log",
            Self::LlmChat { .. } => "llm-chat",
            Self::ApprovalGate { .. } => "approval-gate",
            Self::MetricUpdate => "metric-update",
        }
    }
}

impl std::fmt::Debug for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// A single named unit of work within a route.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
}

/// A named, ordered list of steps.
#[derive(Debug, Clone)]
pub struct Route {
    id: String,
    steps: Vec<Step>,
}

impl Route {
    /// Route identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Step names in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Builder for declaratively composed routes.
pub struct RouteBuilder {
    id: String,
    steps: Vec<Step>,
}

impl RouteBuilder {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
        }
    }

    /// Add a compute step.
    #[must_use]
    pub fn transform<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&StepInput<'_>) -> EngineResult<String> + Send + Sync + 'static,
    {
        self.steps.push(Step {
            name: name.to_string(),
            action: StepAction::Transform(Arc::new(f)),
        });
        self
    }

    /// Add an audit-log step.
    #[must_use]
    pub fn audit_log(mut self, name: &str) -> Self {
        self.steps.push(Step {
            name: name.to_string(),
            action: StepAction::AuditLog,
        });
        self
    }

    /// Add an LLM call step.
    #[must_use]
    pub fn llm_chat(mut self, name: &str, streaming: bool) -> Self {
        self.steps.push(Step {
            name: name.to_string(),
            action: StepAction::LlmChat { streaming },
        });
        self
    }

    /// Add an approval gate step.
    #[must_use]
    pub fn approval_gate(mut self, name: &str, timeout: Duration) -> Self {
        self.steps.push(Step {
            name: name.to_string(),
            action: StepAction::ApprovalGate { timeout },
        });
        self
    }

    /// Add a metric-update step.
    #[must_use]
    pub fn metric_update(mut self, name: &str) -> Self {
        self.steps.push(Step {
            name: name.to_string(),
            action: StepAction::MetricUpdate,
        });
        self
    }

    /// Finalize the route.
    ///
    /// # Panics
    ///
    /// Panics when two steps share a name; checkpoint idempotence keys on
    /// `(exchange_id, step_name)`, so step names must be unique within a
    /// route. Routes are composed at startup, so this is a programming error.
    #[must_use]
    pub fn build(self) -> Route {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            assert!(
                seen.insert(step.name.as_str()),
                "duplicate step name '{}' in route '{}'",
                step.name,
                self.id
            );
        }
        Route {
            id: self.id,
            steps: self.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_preserves_order() {
        let route = RouteBuilder::new("test")
            .transform("first", |input| Ok(input.body.to_string()))
            .audit_log("second")
            .llm_chat("third", false)
            .approval_gate("fourth", Duration::from_secs(60))
            .metric_update("fifth")
            .build();

        assert_eq!(route.id(), "test");
        assert_eq!(
            route.step_names(),
            vec!["first", "second", "third", "fourth", "fifth"]
        );
        assert_eq!(route.steps()[2].action.kind(), "llm-chat");
    }

    #[test]
    #[should_panic(expected = "duplicate step name")]
    fn test_builder_rejects_duplicate_names() {
        let _ = RouteBuilder::new("test")
            .audit_log("step")
            .audit_log("step")
            .build();
    }
}
