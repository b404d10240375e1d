//! The policy decision engine.
//!
//! Evaluation is first-match over the declared policy order: the first
//! policy whose rule tree evaluates true determines the effect, and a
//! request matching no policy is denied with no matched policy name.
//! Group semantics are explicit because they are a classic authoring trap:
//! `AND` over zero children is true (vacuous truth), `OR` over zero
//! children is false.
//!
//! `evaluate` is synchronous and CPU-bound; it never errors for a
//! well-formed loaded set and performs no I/O. The current [`PolicySet`]
//! lives behind a swap-on-write snapshot: readers clone the `Arc` under a
//! momentary lock and evaluate lock-free against a consistent view, so a
//! concurrent reload can never expose a half-updated set.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::warn;

use crate::cache::DecisionCache;
use crate::errors::PolicyError;
use crate::metrics::EngineMetricsHelper;
use crate::model::{
    AccessRequest, AttributeValue, Combinator, Decision, Effect, Operator, PolicyDocument,
};
use crate::policy::{self, AttributePath, CompiledRule, CompiledValue, PolicySet};

/// What to answer while no valid policy set has ever been loaded.
///
/// `FailOpen` is an explicit opt-in for non-production use; the default is
/// fail-closed. Once a last-known-good set exists it always wins and this
/// mode is irrelevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    #[default]
    FailClosed,
    FailOpen,
}

struct VersionedSnapshot {
    set: Option<Arc<PolicySet>>,
    /// Bumped on every reload. Cache entries carry the generation they
    /// were computed under, so an entry from a superseded set is
    /// recognizable even if it was inserted after the reload's clear.
    generation: u64,
}

pub struct DecisionEngine {
    snapshot: RwLock<VersionedSnapshot>,
    fail_mode: FailMode,
}

impl DecisionEngine {
    pub fn new(set: PolicySet) -> Self {
        Self {
            snapshot: RwLock::new(VersionedSnapshot {
                set: Some(Arc::new(set)),
                generation: 1,
            }),
            fail_mode: FailMode::FailClosed,
        }
    }

    /// An engine with no policy set yet, e.g. bootstrapping against a
    /// remote source that has not answered.
    pub fn unloaded(fail_mode: FailMode) -> Self {
        if fail_mode == FailMode::FailOpen {
            warn!("engine configured fail-open: requests are permitted until a policy set loads");
        }
        Self {
            snapshot: RwLock::new(VersionedSnapshot {
                set: None,
                generation: 0,
            }),
            fail_mode,
        }
    }

    /// The current immutable snapshot, if any set has loaded.
    pub fn snapshot(&self) -> Option<Arc<PolicySet>> {
        self.current().0
    }

    /// The current snapshot together with its generation, read under one
    /// lock so the pair is always consistent.
    pub fn current(&self) -> (Option<Arc<PolicySet>>, u64) {
        let guard = match self.snapshot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (guard.set.clone(), guard.generation)
    }

    /// Atomically replace the whole policy set and bump the generation.
    /// The new set is fully built before the swap; concurrent evaluations
    /// finish on whichever snapshot they started with.
    pub fn reload(&self, set: PolicySet) {
        let set = Arc::new(set);
        let mut guard = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.set = Some(set);
        guard.generation += 1;
    }

    /// Evaluate one request against the current snapshot. Pure aside from
    /// the audit fields on the returned decision; never errors.
    pub fn evaluate(&self, request: &AccessRequest) -> Decision {
        let (set, _) = self.current();
        self.evaluate_loaded(set.as_deref(), request)
    }

    fn evaluate_loaded(&self, set: Option<&PolicySet>, request: &AccessRequest) -> Decision {
        match set {
            Some(set) => evaluate_against(set, request),
            None => match self.fail_mode {
                FailMode::FailClosed => Decision::default_deny(),
                FailMode::FailOpen => {
                    warn!(
                        resource_type = %request.resource_type,
                        action = %request.action,
                        "no policy set loaded; permitting under fail-open override"
                    );
                    Decision {
                        effect: Effect::Permit,
                        matched_policy: None,
                        evaluated_at: Utc::now(),
                    }
                }
            },
        }
    }
}

/// First-match evaluation against one consistent snapshot.
pub fn evaluate_against(set: &PolicySet, request: &AccessRequest) -> Decision {
    for policy in &set.policies {
        if eval_rule(&policy.rule, request) {
            return Decision {
                effect: policy.effect,
                matched_policy: Some(policy.name.clone()),
                evaluated_at: Utc::now(),
            };
        }
    }
    Decision::default_deny()
}

fn eval_rule(rule: &CompiledRule, request: &AccessRequest) -> bool {
    match rule {
        CompiledRule::Group {
            combinator: Combinator::And,
            children,
        } => children.iter().all(|child| eval_rule(child, request)),
        CompiledRule::Group {
            combinator: Combinator::Or,
            children,
        } => children.iter().any(|child| eval_rule(child, request)),
        CompiledRule::Condition {
            path,
            operator,
            value,
        } => {
            let left = resolve(path, request);
            let right = match value {
                CompiledValue::Literal(literal) => Some(literal.clone()),
                CompiledValue::Reference(path) => resolve(path, request),
            };
            eval_condition(left.as_ref(), *operator, right.as_ref())
        }
    }
}

/// Namespace lookup for one attribute path. A missing attribute (or a
/// missing whole namespace, e.g. an anonymous subject) resolves to `None`
/// and flows through the operator semantics below; it never aborts
/// evaluation.
fn resolve(path: &AttributePath, request: &AccessRequest) -> Option<AttributeValue> {
    match path {
        AttributePath::Subject(key) => request.subject.get(key).cloned(),
        AttributePath::Context(key) => request.context.get(key).cloned(),
        AttributePath::ResourceType => {
            Some(AttributeValue::Text(request.resource_type.clone()))
        }
        AttributePath::Action => Some(AttributeValue::Text(request.action.clone())),
    }
}

/// Absent semantics: absent never equals anything, so EQUALS is false and
/// NOT_EQUALS is true whenever either side is absent; IN with an absent
/// side is false. IN requires a sequence on the right; anything else
/// fails the condition rather than degrading into an equality test.
fn eval_condition(
    left: Option<&AttributeValue>,
    operator: Operator,
    right: Option<&AttributeValue>,
) -> bool {
    match operator {
        Operator::Equals => matches!((left, right), (Some(l), Some(r)) if l == r),
        Operator::NotEquals => !matches!((left, right), (Some(l), Some(r)) if l == r),
        Operator::In => match (left, right) {
            (Some(AttributeValue::List(lhs)), Some(AttributeValue::List(rhs))) => {
                lhs.iter().any(|candidate| rhs.contains(candidate))
            }
            (Some(scalar), Some(AttributeValue::List(rhs))) => rhs.contains(scalar),
            _ => false,
        },
    }
}

/// The engine plus its decision cache: the surface request handlers talk
/// to. A cache miss evaluates against the current snapshot and inserts
/// last-writer-wins; concurrent misses on one key may both compute, but
/// they compute against the same snapshot, so the entries agree. Every
/// entry carries the generation of the snapshot it was computed under, so
/// an insert racing a reload cannot resurrect a superseded decision.
pub struct DecisionService {
    engine: Arc<DecisionEngine>,
    cache: Arc<DecisionCache>,
}

impl DecisionService {
    pub fn new(engine: Arc<DecisionEngine>, cache: Arc<DecisionCache>) -> Self {
        Self { engine, cache }
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    pub async fn decide(&self, request: &AccessRequest) -> Decision {
        let (set, generation) = self.engine.current();
        if let Some(decision) = self.cache.get(request, generation).await {
            EngineMetricsHelper::record_decision(&decision, &request.resource_type, &request.action, "cache");
            return decision;
        }
        let started = std::time::Instant::now();
        let decision = self.engine.evaluate_loaded(set.as_deref(), request);
        EngineMetricsHelper::record_decision_duration(&decision, started.elapsed());
        self.cache.put(request, decision.clone(), generation).await;
        EngineMetricsHelper::record_decision(&decision, &request.resource_type, &request.action, "engine");
        decision
    }

    /// Compile and atomically install a new policy document. Rejected
    /// documents leave the previous set serving. A successful swap clears
    /// the cache: a decision computed under a superseded set must never be
    /// served.
    pub async fn reload(&self, document: &PolicyDocument) -> Result<usize, PolicyError> {
        let set = policy::compile(document)?;
        let count = set.len();
        self.engine.reload(set);
        self.cache.clear().await;
        Ok(count)
    }

    pub async fn invalidate_cache(&self) -> usize {
        self.cache.clear().await
    }
}
