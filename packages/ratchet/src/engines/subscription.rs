//! Subscription resolution engine.
//!
//! Subscribers ask for topics; a [`TopicCatalog`] says which provider serves
//! each topic. The pre drains new requests from a [`SubscriptionSource`] into
//! a pending queue, and the main resolves everything pending.
//!
//! Catalog patterns are either exact (`orders.created`) or prefixes
//! (`orders.*`, or `*` for everything). Resolution picks the most specific
//! match: an exact pattern beats any prefix, and a longer prefix beats a
//! shorter one. Two different providers at the same specificity are a
//! conflict, reported rather than guessed.
//!
//! A `subscription_resolution` trigger may carry extra requests as
//! `{"requests": [{"subscriber": "...", "topic": "..."}]}`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::lock;
use crate::action::{Action, ActionContext, CompoundingAction};
use crate::engine::EngineDescriptor;
use crate::record::Payload;
use crate::trigger::SUBSCRIPTION_RESOLUTION;

/// Action name of the resolution pass.
pub const RESOLVE_ACTION: &str = "resolve";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub subscriber: String,
    pub topic: String,
}

impl SubscriptionRequest {
    pub fn new(subscriber: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            topic: topic.into(),
        }
    }
}

#[async_trait]
pub trait SubscriptionSource: Send + Sync + 'static {
    /// Requests received since the last call.
    async fn drain(&self) -> Result<Vec<SubscriptionRequest>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    Exact(String),
    /// Matches every topic starting with the stored prefix.
    Prefix(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => TopicPattern::Prefix(prefix.to_string()),
            None => TopicPattern::Exact(pattern.to_string()),
        }
    }

    /// Specificity of a match against `topic`, if it matches. Exact matches
    /// rank above every prefix.
    fn rank(&self, topic: &str) -> Option<usize> {
        match self {
            TopicPattern::Exact(exact) => (exact == topic).then_some(usize::MAX),
            TopicPattern::Prefix(prefix) => {
                topic.starts_with(prefix.as_str()).then_some(prefix.len())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    Unresolved,
    Conflict(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct TopicCatalog {
    entries: Vec<(TopicPattern, String)>,
}

impl TopicCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pattern: &str, provider: impl Into<String>) -> Self {
        self.entries.push((TopicPattern::parse(pattern), provider.into()));
        self
    }

    pub fn resolve(&self, topic: &str) -> Resolution {
        let mut best: Option<usize> = None;
        let mut providers = BTreeSet::new();
        for (pattern, provider) in &self.entries {
            let Some(rank) = pattern.rank(topic) else {
                continue;
            };
            match best {
                Some(current) if rank < current => continue,
                Some(current) if rank == current => {}
                _ => {
                    best = Some(rank);
                    providers.clear();
                }
            }
            providers.insert(provider.clone());
        }

        let mut providers: Vec<String> = providers.into_iter().collect();
        match providers.len() {
            0 => Resolution::Unresolved,
            1 => Resolution::Resolved(providers.remove(0)),
            _ => Resolution::Conflict(providers),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub main_interval: Duration,
    pub pre_fraction: Option<f64>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            main_interval: Duration::from_secs(10),
            pre_fraction: None,
        }
    }
}

struct Resolver {
    source: Arc<dyn SubscriptionSource>,
    catalog: TopicCatalog,
    pending: Mutex<Vec<SubscriptionRequest>>,
    /// Established subscriptions and their provider.
    active: Mutex<BTreeMap<SubscriptionRequest, String>>,
}

struct DrainRequests(Arc<Resolver>);

#[async_trait]
impl Action for DrainRequests {
    async fn run(&self, _ctx: ActionContext) -> Result<Payload> {
        let drained = self.0.source.drain().await?;
        let count = drained.len();
        let mut pending = lock(&self.0.pending);
        pending.extend(drained);

        let mut payload = Payload::new();
        payload.insert("drained".into(), count.into());
        payload.insert("pending".into(), pending.len().into());
        Ok(payload)
    }
}

struct ResolveRequests(Arc<Resolver>);

fn requests_from_payload(payload: &Payload) -> Result<Vec<SubscriptionRequest>> {
    match payload.get("requests") {
        Some(requests) => serde_json::from_value(requests.clone())
            .context("trigger payload field `requests` is malformed"),
        None => Ok(Vec::new()),
    }
}

#[async_trait]
impl Action for ResolveRequests {
    async fn run(&self, ctx: ActionContext) -> Result<Payload> {
        let extra = requests_from_payload(ctx.trigger_payload())?;
        let requests: BTreeSet<SubscriptionRequest> = lock(&self.0.pending)
            .drain(..)
            .chain(extra)
            .collect();

        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();
        let mut conflicts = Vec::new();
        let mut duplicates = 0usize;

        let mut active = lock(&self.0.active);
        for request in requests {
            if active.contains_key(&request) {
                duplicates += 1;
                continue;
            }
            match self.0.catalog.resolve(&request.topic) {
                Resolution::Resolved(provider) => {
                    resolved.push(json!({
                        "subscriber": request.subscriber,
                        "topic": request.topic,
                        "provider": provider,
                    }));
                    active.insert(request, provider);
                }
                Resolution::Unresolved => unresolved.push(json!(request)),
                Resolution::Conflict(providers) => conflicts.push(json!({
                    "subscriber": request.subscriber,
                    "topic": request.topic,
                    "providers": providers,
                })),
            }
        }

        let mut payload = Payload::new();
        payload.insert("resolved".into(), Value::Array(resolved));
        payload.insert("unresolved".into(), Value::Array(unresolved));
        payload.insert("conflicts".into(), Value::Array(conflicts));
        payload.insert("duplicates".into(), duplicates.into());
        payload.insert("active".into(), active.len().into());
        Ok(payload)
    }
}

/// An engine resolving requests from `source` against `catalog`, handling
/// `subscription_resolution` triggers.
pub fn subscription_engine(
    name: impl Into<String>,
    source: impl SubscriptionSource,
    catalog: TopicCatalog,
    config: SubscriptionConfig,
) -> EngineDescriptor {
    let resolver = Arc::new(Resolver {
        source: Arc::new(source),
        catalog,
        pending: Mutex::new(Vec::new()),
        active: Mutex::new(BTreeMap::new()),
    });

    let mut action = CompoundingAction::new(
        RESOLVE_ACTION,
        config.main_interval,
        ResolveRequests(resolver.clone()),
    )
    .with_pre(DrainRequests(resolver));
    if let Some(fraction) = config.pre_fraction {
        action = action.with_pre_fraction(fraction);
    }

    EngineDescriptor::new(name)
        .handles(SUBSCRIPTION_RESOLUTION)
        .with_metadata("kind", "subscription")
        .with_action(action)
}
