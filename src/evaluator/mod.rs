//! Threat Evaluation Pipeline
//!
//! Three stages per event, cheapest first:
//!
//! 1. Exception matcher — denylist / critical-signature short-circuit
//! 2. Rule/heuristic scorer — feature ensemble, returned when confident
//! 3. Remote deep evaluator — admission-gated, retried, never missing
//!    (a deterministic fallback stands in for every remote failure mode)
//!
//! The router owns the deep-stage admission gate; the daemon reuses the same
//! gate for its asynchronous follow-up queue so the per-minute budget is
//! shared between both paths.

mod deep;
mod exception;
mod gate;
mod rules;

pub use deep::DeepEvaluator;
pub use exception::ExceptionMatcher;
pub use gate::DeepGate;
pub use rules::RuleScorer;

use std::sync::Arc;

use tracing::debug;

use crate::config::AzazelConfig;
use crate::types::{Clock, Event, ScoreResult};

/// Rule results at or above this confidence skip the deep stage.
const RULE_CONFIDENCE_GATE: f64 = 0.7;

pub struct ThreatEvaluator {
    exception: ExceptionMatcher,
    rules: RuleScorer,
    deep: DeepEvaluator,
    gate: Arc<DeepGate>,
}

impl ThreatEvaluator {
    pub fn new(config: &AzazelConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            exception: ExceptionMatcher::new(&config.soc),
            rules: RuleScorer::new(clock.clone()),
            deep: DeepEvaluator::new(&config.ai),
            gate: Arc::new(DeepGate::new(
                config.ai.deep_sample_rate,
                config.ai.deep_max_per_min,
                clock,
            )),
        }
    }

    /// Run the staged pipeline for one event.
    pub async fn evaluate(&self, event: &Event) -> ScoreResult {
        if let Some(hit) = self.exception.check(event) {
            return hit;
        }

        let rule = self.rules.evaluate(event);
        if rule.confidence >= RULE_CONFIDENCE_GATE {
            return rule;
        }

        if !self.gate.admit() {
            debug!("Deep stage not admitted, keeping rule result");
            return rule;
        }

        self.deep.evaluate(event, Some(rule.category)).await
    }

    /// Deep analysis for the background follow-up queue. Admission is decided
    /// at enqueue time, so this always runs the deep stage.
    pub async fn deep_followup(&self, event: &Event) -> ScoreResult {
        let hint = Some(self.rules.evaluate(event).category);
        self.deep.evaluate(event, hint).await
    }

    /// Shared admission gate (sampling + token bucket).
    pub fn gate(&self) -> Arc<DeepGate> {
        self.gate.clone()
    }
}
