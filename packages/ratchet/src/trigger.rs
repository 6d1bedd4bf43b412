//! Context triggers: out-of-cadence passes selected by a context tag.
//!
//! Engines declare the contexts they handle (and optionally a predicate over
//! the trigger payload) when they register. The [`TriggerRouter`] maps a
//! [`Trigger`] to the ordered list of engines that should fire.
//!
//! Ordering is priority ascending, then registration order. The wildcard
//! context `*` matches every trigger.

use std::fmt;
use std::sync::Arc;

use crate::record::Payload;

/// Reserved context: resolve pending subscriptions.
pub const SUBSCRIPTION_RESOLUTION: &str = "subscription_resolution";
/// Reserved context: look for impending failures.
pub const FAILURE_PREVENTION: &str = "failure_prevention";
/// Reserved context: rebalance work between workers.
pub const COORDINATION_OPTIMIZATION: &str = "coordination_optimization";
/// Reserved context: external feedback arrived.
pub const FEEDBACK: &str = "feedback";
/// Reserved context: an operator asked for a pass.
pub const MANUAL: &str = "manual";
/// Matches every context.
pub const WILDCARD: &str = "*";
/// Context recorded for passes an engine requested through its handle.
pub const SELF_CONTEXT: &str = "self";

/// Contexts reserved by the orchestrator.
pub const RESERVED_CONTEXTS: [&str; 5] = [
    SUBSCRIPTION_RESOLUTION,
    FAILURE_PREVENTION,
    COORDINATION_OPTIMIZATION,
    FEEDBACK,
    MANUAL,
];

/// Predicate an engine uses to accept or decline a trigger payload.
pub type PayloadPredicate = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;

// =============================================================================
// Trigger
// =============================================================================

/// An explicit request to fire the engines handling `context`.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub context: String,
    pub payload: Payload,
    /// Include disabled engines.
    pub force: bool,
}

impl Trigger {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            payload: Payload::new(),
            force: false,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

// =============================================================================
// Router
// =============================================================================

/// One engine's routing declaration.
#[derive(Clone)]
pub struct TriggerRule {
    engine: String,
    priority: i32,
    contexts: Vec<String>,
    predicate: Option<PayloadPredicate>,
}

impl TriggerRule {
    pub fn new(engine: impl Into<String>, priority: i32, contexts: Vec<String>) -> Self {
        Self {
            engine: engine.into(),
            priority,
            contexts,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Option<PayloadPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    fn matches(&self, context: &str, payload: &Payload) -> bool {
        let handles = self
            .contexts
            .iter()
            .any(|declared| declared == WILDCARD || declared == context);
        handles && self.predicate.as_ref().map_or(true, |accept| accept(payload))
    }
}

impl fmt::Debug for TriggerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRule")
            .field("engine", &self.engine)
            .field("priority", &self.priority)
            .field("contexts", &self.contexts)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Maps contexts to engines.
#[derive(Debug, Default, Clone)]
pub struct TriggerRouter {
    rules: Vec<TriggerRule>,
}

impl TriggerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. Rules added earlier win priority ties.
    pub fn add(&mut self, rule: TriggerRule) {
        self.rules.push(rule);
    }

    pub fn set_priority(&mut self, engine: &str, priority: i32) {
        if let Some(rule) = self.rules.iter_mut().find(|rule| rule.engine == engine) {
            rule.priority = priority;
        }
    }

    /// Engines whose declared contexts contain `context` (or `*`) and whose
    /// predicate accepts `payload`, ordered by priority then registration.
    pub fn route(&self, context: &str, payload: &Payload) -> Vec<String> {
        let mut matched: Vec<(i32, usize, &str)> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.matches(context, payload))
            .map(|(order, rule)| (rule.priority, order, rule.engine.as_str()))
            .collect();
        matched.sort_by_key(|(priority, order, _)| (*priority, *order));
        matched
            .into_iter()
            .map(|(_, _, engine)| engine.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(engine: &str, priority: i32, contexts: &[&str]) -> TriggerRule {
        TriggerRule::new(
            engine,
            priority,
            contexts.iter().map(|c| c.to_string()).collect(),
        )
    }

    #[test]
    fn wildcard_matches_known_and_unknown_contexts() {
        let mut router = TriggerRouter::new();
        router.add(rule("e1", 0, &[SUBSCRIPTION_RESOLUTION]));
        router.add(rule("e2", 0, &[FAILURE_PREVENTION]));
        router.add(rule("e3", 0, &[WILDCARD]));

        assert_eq!(
            router.route(SUBSCRIPTION_RESOLUTION, &Payload::new()),
            vec!["e1", "e3"]
        );
        assert_eq!(router.route("unheard_of", &Payload::new()), vec!["e3"]);
    }

    #[test]
    fn priority_orders_before_registration() {
        let mut router = TriggerRouter::new();
        router.add(rule("late", 5, &[MANUAL]));
        router.add(rule("early", -1, &[MANUAL]));
        router.add(rule("tie", 5, &[MANUAL]));

        assert_eq!(
            router.route(MANUAL, &Payload::new()),
            vec!["early", "late", "tie"]
        );
    }

    #[test]
    fn predicate_filters_payloads() {
        let mut router = TriggerRouter::new();
        let predicate: PayloadPredicate =
            Arc::new(|payload: &Payload| payload.get("severity") == Some(&json!("high")));
        router.add(rule("picky", 0, &[FEEDBACK]).with_predicate(Some(predicate)));

        let high = json!({ "severity": "high" }).as_object().cloned().unwrap();
        let low = json!({ "severity": "low" }).as_object().cloned().unwrap();
        assert_eq!(router.route(FEEDBACK, &high), vec!["picky"]);
        assert!(router.route(FEEDBACK, &low).is_empty());
    }

    #[test]
    fn trigger_builder_sets_force() {
        let trigger = Trigger::new(MANUAL).force();
        assert!(trigger.force);
        assert!(trigger.payload.is_empty());
    }
}
