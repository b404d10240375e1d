//! Library-level behavior tests: policy ordering, cache interplay, and the
//! fail-secure refresh path against a file source.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use pdp_service::{
    compile, AccessRequest, AttributeMap, BreakerConfig, DecisionCache, DecisionCacheConfig,
    DecisionEngine, DecisionService, Effect, FailMode, FilePolicySource, PolicyDocument,
    PolicyRefresher, SubjectAttributes, SubjectDirectory,
};
use serde_json::json;

fn engine_from(value: serde_json::Value) -> Arc<DecisionEngine> {
    let document: PolicyDocument = serde_json::from_value(value).unwrap();
    Arc::new(DecisionEngine::new(compile(&document).unwrap()))
}

fn service_from(value: serde_json::Value) -> DecisionService {
    DecisionService::new(
        engine_from(value),
        Arc::new(DecisionCache::new(DecisionCacheConfig::default())),
    )
}

fn request(role: &str, resource_type: &str, action: &str) -> AccessRequest {
    let mut subject = AttributeMap::new();
    subject.insert("role".into(), role.into());
    AccessRequest {
        subject,
        resource_type: resource_type.into(),
        action: action.into(),
        context: AttributeMap::new(),
    }
}

// Two policies whose rules overlap on (plans, read) for administrators.
// With first-match semantics their relative order decides the outcome.
fn overlapping(first_deny: bool) -> serde_json::Value {
    let deny = json!({
        "name": "deny_reads",
        "effect": "DENY",
        "rule": {"attribute": "action", "operator": "EQUALS", "value": "read"}
    });
    let permit = json!({
        "name": "admin_reads",
        "effect": "PERMIT",
        "rule": {
            "condition": "AND",
            "rules": [
                {"attribute": "subject.role", "operator": "EQUALS", "value": "admin"},
                {"attribute": "action", "operator": "EQUALS", "value": "read"}
            ]
        }
    });
    let policies = if first_deny {
        vec![deny, permit]
    } else {
        vec![permit, deny]
    };
    json!({ "policies": policies })
}

#[tokio::test]
async fn overlapping_policy_order_decides_the_outcome() {
    let deny_first = service_from(overlapping(true));
    let permit_first = service_from(overlapping(false));
    let req = request("admin", "plans", "read");

    let a = deny_first.decide(&req).await;
    assert_eq!(a.effect, Effect::Deny);
    assert_eq!(a.matched_policy.as_deref(), Some("deny_reads"));

    let b = permit_first.decide(&req).await;
    assert_eq!(b.effect, Effect::Permit);
    assert_eq!(b.matched_policy.as_deref(), Some("admin_reads"));
}

#[tokio::test]
async fn repeated_decisions_are_identical_and_cache_served() {
    let service = service_from(overlapping(false));
    let req = request("admin", "plans", "read");

    let first = service.decide(&req).await;
    let second = service.decide(&req).await;
    assert_eq!(first.effect, second.effect);
    assert_eq!(first.matched_policy, second.matched_policy);
    // The second call must not have re-evaluated.
    assert_eq!(first.evaluated_at, second.evaluated_at);

    let stats = service.cache().stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn concurrent_decisions_agree() {
    let service = Arc::new(service_from(overlapping(false)));
    let req = request("admin", "plans", "read");

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let service = Arc::clone(&service);
            let req = req.clone();
            tokio::spawn(async move { service.decide(&req).await })
        })
        .collect();

    let decisions = futures::future::join_all(tasks).await;
    for decision in decisions {
        let decision = decision.unwrap();
        assert_eq!(decision.effect, Effect::Permit);
        assert_eq!(decision.matched_policy.as_deref(), Some("admin_reads"));
    }
}

#[tokio::test]
async fn service_reload_clears_cached_decisions() {
    let service = service_from(overlapping(false));
    let req = request("admin", "plans", "read");
    assert_eq!(service.decide(&req).await.effect, Effect::Permit);

    let replacement: PolicyDocument =
        serde_json::from_value(overlapping(true)).unwrap();
    service.reload(&replacement).await.unwrap();

    // Same request, fresh evaluation under the new set.
    let decision = service.decide(&req).await;
    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.matched_policy.as_deref(), Some("deny_reads"));
}

#[tokio::test]
async fn in_flight_decision_from_a_superseded_set_is_never_served() {
    let service = service_from(overlapping(false));
    let req = request("admin", "plans", "read");

    // An in-flight request captures the snapshot plus its generation and
    // evaluates, but stalls before inserting into the cache.
    let (set, generation) = service.engine().current();
    let in_flight = pdp_service::engine::evaluate_against(&set.unwrap(), &req);
    assert_eq!(in_flight.effect, Effect::Permit);

    // A reload lands in the gap, swapping the set and clearing the cache.
    let replacement: PolicyDocument = serde_json::from_value(overlapping(true)).unwrap();
    service.reload(&replacement).await.unwrap();

    // The stalled insert now completes, after the reload's clear.
    service.cache().put(&req, in_flight, generation).await;

    // The entry belongs to the superseded set and must not be served.
    let decision = service.decide(&req).await;
    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.matched_policy.as_deref(), Some("deny_reads"));
}

#[tokio::test]
async fn rejected_document_leaves_the_service_untouched() {
    let service = service_from(overlapping(false));
    let req = request("admin", "plans", "read");
    assert_eq!(service.decide(&req).await.effect, Effect::Permit);

    let broken: PolicyDocument = serde_json::from_value(json!({
        "policies": [{
            "name": "dangling",
            "effect": "PERMIT",
            "rule": {"rule": "no_such_shared_rule"}
        }]
    }))
    .unwrap();
    assert!(service.reload(&broken).await.is_err());
    assert_eq!(service.decide(&req).await.effect, Effect::Permit);
}

fn write_document(file: &mut tempfile::NamedTempFile, value: &serde_json::Value) {
    use std::io::Seek;
    file.as_file_mut().set_len(0).unwrap();
    file.rewind().unwrap();
    file.write_all(value.to_string().as_bytes()).unwrap();
    file.flush().unwrap();
}

#[tokio::test]
async fn file_refresh_survives_corruption_and_recovers() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_document(&mut file, &overlapping(false));

    let engine = Arc::new(DecisionEngine::unloaded(FailMode::FailClosed));
    let cache = Arc::new(DecisionCache::new(DecisionCacheConfig::default()));
    let refresher = PolicyRefresher::new(
        Arc::clone(&engine),
        Arc::clone(&cache),
        Arc::new(SubjectDirectory::new(SubjectAttributes::new())),
        Arc::new(FilePolicySource::new(file.path())),
        BreakerConfig {
            failure_threshold: 10,
            cooldown: Duration::from_millis(10),
        },
    );

    let req = request("admin", "plans", "read");

    // First cycle installs the initial document.
    assert!(refresher.refresh_once().await);
    assert_eq!(engine.evaluate(&req).effect, Effect::Permit);

    // A corrupted file fails the cycle but keeps the old set serving.
    write_document(&mut file, &json!("not a policy document"));
    assert!(!refresher.refresh_once().await);
    assert_eq!(engine.evaluate(&req).effect, Effect::Permit);

    // Once the file is repaired the next cycle picks up the new semantics.
    write_document(&mut file, &overlapping(true));
    assert!(refresher.refresh_once().await);
    let decision = engine.evaluate(&req);
    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.matched_policy.as_deref(), Some("deny_reads"));
}

#[tokio::test]
async fn refresh_swaps_the_subject_directory_from_the_bundle() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_document(
        &mut file,
        &json!({
            "policies": [],
            "subjects": {
                "alice": {"role": "plan_administrator", "assigned_accounts": [1, 2, 5]}
            }
        }),
    );

    let directory = Arc::new(SubjectDirectory::new(SubjectAttributes::new()));
    let refresher = PolicyRefresher::new(
        Arc::new(DecisionEngine::unloaded(FailMode::FailClosed)),
        Arc::new(DecisionCache::new(DecisionCacheConfig::default())),
        Arc::clone(&directory),
        Arc::new(FilePolicySource::new(file.path())),
        BreakerConfig::default(),
    );

    assert!(directory.snapshot().is_empty());
    assert!(refresher.refresh_once().await);
    assert!(directory.snapshot().contains_key("alice"));
}
