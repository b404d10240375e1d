//! Policy document compilation.
//!
//! A [`PolicyDocument`] is validated and lowered into an immutable
//! [`PolicySet`] before it can serve a single decision: duplicate policy
//! names are rejected, shared-rule references are expanded with a
//! visited-set walk (so self- or mutually-referential definitions fail
//! here instead of recursing at evaluation time), attribute paths are
//! parsed into a typed resolver, and literals are checked for shape.
//! Evaluation against a compiled set never errors.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::errors::PolicyError;
use crate::model::{
    AttributeValue, Combinator, ConditionValue, Effect, Operator, PolicyDocument, RuleNode,
};

/// Depth bound on the expanded rule tree. Generous for hand-written
/// policies; mostly a backstop against runaway shared-rule chains.
pub const MAX_RULE_DEPTH: usize = 32;

/// A parsed attribute path, keyed by namespace prefix so missing-namespace
/// mistakes fail at load time instead of silently never matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributePath {
    Subject(String),
    ResourceType,
    Action,
    Context(String),
}

impl AttributePath {
    pub fn parse(path: &str) -> Result<Self, PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidAttributePath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        match path.split_once('.') {
            None if path == "action" => Ok(Self::Action),
            None => Err(invalid(
                "expected 'action' or a namespaced path like 'subject.role'",
            )),
            Some(("subject", key)) if !key.is_empty() => Ok(Self::Subject(key.to_string())),
            Some(("context", key)) if !key.is_empty() => Ok(Self::Context(key.to_string())),
            Some(("resource", "type")) => Ok(Self::ResourceType),
            Some(("resource", _)) => Err(invalid("only 'resource.type' is addressable")),
            Some((ns, _)) => Err(invalid(&format!("unknown namespace '{ns}'"))),
        }
    }
}

/// Right-hand side of a compiled condition.
#[derive(Debug, Clone)]
pub enum CompiledValue {
    Literal(AttributeValue),
    /// Resolved against the same request at evaluation time; an
    /// unresolved reference behaves as an absent value.
    Reference(AttributePath),
}

/// A rule tree with all shared references expanded and paths parsed.
#[derive(Debug, Clone)]
pub enum CompiledRule {
    Condition {
        path: AttributePath,
        operator: Operator,
        value: CompiledValue,
    },
    Group {
        combinator: Combinator,
        children: Vec<CompiledRule>,
    },
}

#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub name: String,
    pub effect: Effect,
    pub rule: CompiledRule,
}

/// An immutable, validated snapshot of the whole policy set. Reload
/// replaces the snapshot wholesale; it is never mutated in place.
#[derive(Debug, Clone)]
pub struct PolicySet {
    pub policies: Vec<CompiledPolicy>,
    pub loaded_at: DateTime<Utc>,
}

impl PolicySet {
    /// An empty set: every request falls through to default-deny.
    pub fn empty() -> Self {
        Self {
            policies: Vec::new(),
            loaded_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Distinct (resource_type, action) pairs the set can ever grant,
    /// derived from literal comparisons in each policy. Drives the
    /// per-subject permission listing.
    pub fn probe_matrix(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for policy in &self.policies {
            let mut resources = Vec::new();
            let mut actions = Vec::new();
            collect_path_literals(&policy.rule, &mut resources, &mut actions);
            for r in &resources {
                for a in &actions {
                    let pair = (r.clone(), a.clone());
                    if !pairs.contains(&pair) {
                        pairs.push(pair);
                    }
                }
            }
        }
        pairs
    }
}

fn collect_path_literals(rule: &CompiledRule, resources: &mut Vec<String>, actions: &mut Vec<String>) {
    match rule {
        CompiledRule::Group { children, .. } => {
            for child in children {
                collect_path_literals(child, resources, actions);
            }
        }
        CompiledRule::Condition {
            path,
            operator: Operator::Equals | Operator::In,
            value: CompiledValue::Literal(literal),
        } => {
            let bucket = match path {
                AttributePath::ResourceType => resources,
                AttributePath::Action => actions,
                _ => return,
            };
            match literal {
                AttributeValue::Text(s) => bucket.push(s.clone()),
                AttributeValue::List(items) => {
                    for item in items {
                        if let AttributeValue::Text(s) = item {
                            bucket.push(s.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        CompiledRule::Condition { .. } => {}
    }
}

/// Compile a policy document into an immutable set, or reject it with the
/// first configuration error found. Rejection is atomic: the caller keeps
/// whatever set it was serving before.
pub fn compile(document: &PolicyDocument) -> Result<PolicySet, PolicyError> {
    let mut seen = HashSet::new();
    for policy in &document.policies {
        if !seen.insert(policy.name.as_str()) {
            return Err(PolicyError::DuplicatePolicyName {
                name: policy.name.clone(),
            });
        }
    }

    let mut compiled = Vec::with_capacity(document.policies.len());
    for policy in &document.policies {
        let mut visited = Vec::new();
        let rule = lower(&policy.rule, &document.rules, &mut visited, 0, &policy.name)?;
        compiled.push(CompiledPolicy {
            name: policy.name.clone(),
            effect: policy.effect,
            rule,
        });
    }

    Ok(PolicySet {
        policies: compiled,
        loaded_at: Utc::now(),
    })
}

fn lower(
    node: &RuleNode,
    shared: &BTreeMap<String, RuleNode>,
    visited: &mut Vec<String>,
    depth: usize,
    policy: &str,
) -> Result<CompiledRule, PolicyError> {
    if depth > MAX_RULE_DEPTH {
        return Err(PolicyError::RuleTreeTooDeep {
            policy: policy.to_string(),
            limit: MAX_RULE_DEPTH,
        });
    }

    match node {
        RuleNode::Group { condition, rules } => {
            let mut children = Vec::with_capacity(rules.len());
            for child in rules {
                children.push(lower(child, shared, visited, depth + 1, policy)?);
            }
            Ok(CompiledRule::Group {
                combinator: *condition,
                children,
            })
        }
        RuleNode::Leaf(condition) => {
            let path = AttributePath::parse(&condition.attribute)?;
            let value = match &condition.value {
                ConditionValue::Literal(literal) => {
                    if !literal.is_flat() {
                        return Err(PolicyError::InvalidLiteral {
                            policy: policy.to_string(),
                            reason: "sequences may only contain scalars".to_string(),
                        });
                    }
                    CompiledValue::Literal(literal.clone())
                }
                ConditionValue::Reference { reference } => {
                    CompiledValue::Reference(AttributePath::parse(reference)?)
                }
            };
            Ok(CompiledRule::Condition {
                path,
                operator: condition.operator,
                value,
            })
        }
        RuleNode::Ref { rule } => {
            if visited.iter().any(|seen| seen == rule) {
                return Err(PolicyError::CyclicRuleReference { name: rule.clone() });
            }
            let target = shared
                .get(rule)
                .ok_or_else(|| PolicyError::UnknownRuleReference { name: rule.clone() })?;
            visited.push(rule.clone());
            let lowered = lower(target, shared, visited, depth + 1, policy)?;
            visited.pop();
            Ok(lowered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document(value: serde_json::Value) -> PolicyDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn compiles_the_plans_scenario() {
        let doc = document(json!({
            "policies": [{
                "name": "plan_create_policy",
                "effect": "PERMIT",
                "rule": {
                    "condition": "AND",
                    "rules": [
                        {"attribute": "subject.role", "operator": "EQUALS", "value": "plan_administrator"},
                        {"attribute": "resource.type", "operator": "EQUALS", "value": "plans"},
                        {"attribute": "action", "operator": "EQUALS", "value": "create"}
                    ]
                }
            }]
        }));
        let set = compile(&doc).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.policies[0].name, "plan_create_policy");
        assert_eq!(set.probe_matrix(), vec![("plans".into(), "create".into())]);
    }

    #[test]
    fn rejects_duplicate_policy_names() {
        let leaf = json!({"attribute": "action", "operator": "EQUALS", "value": "read"});
        let doc = document(json!({
            "policies": [
                {"name": "p", "effect": "PERMIT", "rule": leaf.clone()},
                {"name": "p", "effect": "DENY", "rule": leaf}
            ]
        }));
        assert!(matches!(
            compile(&doc),
            Err(PolicyError::DuplicatePolicyName { .. })
        ));
    }

    #[test]
    fn rejects_unknown_rule_reference() {
        let doc = document(json!({
            "policies": [{"name": "p", "effect": "PERMIT", "rule": {"rule": "missing"}}]
        }));
        assert!(matches!(
            compile(&doc),
            Err(PolicyError::UnknownRuleReference { .. })
        ));
    }

    #[test]
    fn rejects_self_referential_rule() {
        let doc = document(json!({
            "rules": {"loop": {"rule": "loop"}},
            "policies": [{"name": "p", "effect": "PERMIT", "rule": {"rule": "loop"}}]
        }));
        assert!(matches!(
            compile(&doc),
            Err(PolicyError::CyclicRuleReference { .. })
        ));
    }

    #[test]
    fn rejects_mutually_referential_rules() {
        let doc = document(json!({
            "rules": {
                "a": {"condition": "AND", "rules": [{"rule": "b"}]},
                "b": {"condition": "OR", "rules": [{"rule": "a"}]}
            },
            "policies": [{"name": "p", "effect": "PERMIT", "rule": {"rule": "a"}}]
        }));
        assert!(matches!(
            compile(&doc),
            Err(PolicyError::CyclicRuleReference { .. })
        ));
    }

    #[test]
    fn shared_rule_may_be_used_twice_without_tripping_cycle_detection() {
        let doc = document(json!({
            "rules": {
                "is_read": {"attribute": "action", "operator": "EQUALS", "value": "read"}
            },
            "policies": [{
                "name": "p",
                "effect": "PERMIT",
                "rule": {"condition": "OR", "rules": [{"rule": "is_read"}, {"rule": "is_read"}]}
            }]
        }));
        // Diamond-shaped reuse is a tree after expansion, not a cycle.
        assert!(compile(&doc).is_ok());
    }

    #[test]
    fn rejects_bad_attribute_paths() {
        for path in ["principal.role", "resource.owner", "role", "subject."] {
            let doc = document(json!({
                "policies": [{
                    "name": "p",
                    "effect": "PERMIT",
                    "rule": {"attribute": path, "operator": "EQUALS", "value": "x"}
                }]
            }));
            assert!(
                matches!(compile(&doc), Err(PolicyError::InvalidAttributePath { .. })),
                "path {path:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_nested_list_literals() {
        let doc = document(json!({
            "policies": [{
                "name": "p",
                "effect": "PERMIT",
                "rule": {"attribute": "subject.role", "operator": "IN", "value": [["a"]]}
            }]
        }));
        assert!(matches!(
            compile(&doc),
            Err(PolicyError::InvalidLiteral { .. })
        ));
    }

    #[test]
    fn rejects_runaway_reference_depth() {
        // A long (acyclic) chain of shared rules past the depth bound.
        let mut shared = serde_json::Map::new();
        for i in 0..40 {
            shared.insert(
                format!("r{i}"),
                json!({"condition": "AND", "rules": [{"rule": format!("r{}", i + 1)}]}),
            );
        }
        shared.insert(
            "r40".to_string(),
            json!({"attribute": "action", "operator": "EQUALS", "value": "read"}),
        );
        let doc = document(json!({
            "rules": shared,
            "policies": [{"name": "p", "effect": "PERMIT", "rule": {"rule": "r0"}}]
        }));
        assert!(matches!(
            compile(&doc),
            Err(PolicyError::RuleTreeTooDeep { .. })
        ));
    }

    #[test]
    fn empty_document_compiles_to_empty_set() {
        let set = compile(&PolicyDocument::default()).unwrap();
        assert!(set.is_empty());
    }
}
