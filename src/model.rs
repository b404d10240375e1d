//! Data model for authorization requests, policies, and decisions.
//!
//! Wire shapes mirror the JSON documents the service accepts: a policy
//! document with a shared-rule table and an ordered policy list, a subject
//! attribute directory, and per-call authorization requests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A single attribute value: a scalar or an ordered sequence of scalars.
///
/// Untagged so JSON literals map directly (`"x"`, `2`, `2.5`, `true`,
/// `[1, 2, 5]`). Integers and floats compare numerically, since policy
/// authors and claims sources mix the two freely.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<AttributeValue>),
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        use AttributeValue::{Bool, Float, Int, List, Text};
        match (self, other) {
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Text(a), Text(b)) => a == b,
            (List(a), List(b)) => a == b,
            _ => false,
        }
    }
}

impl AttributeValue {
    /// Maximum nesting for request-side values: sequences of scalars only.
    pub fn is_flat(&self) -> bool {
        match self {
            Self::List(items) => items.iter().all(|v| !matches!(v, Self::List(_))),
            _ => true,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

/// Attribute name to value mapping. `BTreeMap` keeps serialization key
/// order deterministic, which the request fingerprint relies on.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Subject identifier to attribute mapping, loaded from the attribute
/// source (the `user_attributes` shape).
pub type SubjectAttributes = BTreeMap<String, AttributeMap>;

/// One authorization question: who is doing what to which kind of resource,
/// under what per-call context.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccessRequest {
    /// Attributes of the already-authenticated subject. May be empty
    /// (anonymous); `subject.*` conditions then never match.
    #[serde(default)]
    pub subject: AttributeMap,
    pub resource_type: String,
    pub action: String,
    /// Per-call dynamic data, e.g. `account_id`.
    #[serde(default)]
    pub context: AttributeMap,
}

impl AccessRequest {
    /// Deterministic cache key for the full request: its canonical JSON.
    /// BTreeMap fields serialize in key order, so the key is independent
    /// of how the caller assembled the maps, and distinct requests can
    /// never share a key. Request validation bounds the key size.
    pub fn fingerprint(&self) -> String {
        format!("decision:{}", serde_json::to_string(self).unwrap_or_default())
    }
}

/// Comparison operator for a leaf condition. Unknown operators fail
/// deserialization, so they are a load-time configuration error rather
/// than a silent deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Equals,
    NotEquals,
    /// Membership: scalar left in sequence right, or non-empty intersection
    /// when both sides are sequences.
    In,
}

/// Boolean combinator for a group node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    And,
    Or,
}

/// Right-hand side of a condition: a literal, or a reference resolved
/// against the same request (`{"ref": "subject.assigned_accounts"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum ConditionValue {
    Reference {
        #[serde(rename = "ref")]
        reference: String,
    },
    Literal(AttributeValue),
}

/// Leaf test over one attribute path.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Condition {
    /// `subject.*`, `resource.type`, `action`, or `context.*`.
    pub attribute: String,
    pub operator: Operator,
    pub value: ConditionValue,
}

/// One node of a policy's rule tree as written in the document: a group,
/// a leaf condition, or a by-name reference into the document's shared
/// rule table.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum RuleNode {
    Group {
        condition: Combinator,
        #[serde(default)]
        rules: Vec<RuleNode>,
    },
    Leaf(Condition),
    Ref {
        rule: String,
    },
}

/// PERMIT or DENY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effect {
    Permit,
    Deny,
}

/// A named policy as written in the document. Document order is
/// first-match precedence.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PolicyDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub rule: RuleNode,
    pub effect: Effect,
}

/// The policy document the service loads and reloads: an optional table of
/// shared rules addressable via `{"rule": "name"}` nodes, plus the ordered
/// policy list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PolicyDocument {
    #[serde(default)]
    pub rules: BTreeMap<String, RuleNode>,
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
}

/// What an upstream policy source hands back on a successful fetch:
/// a policy document and, optionally, a refreshed subject directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PolicyBundle {
    #[serde(flatten)]
    pub document: PolicyDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjects: Option<SubjectAttributes>,
}

/// The outcome of evaluating one request. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Decision {
    pub effect: Effect,
    /// Name of the first policy whose rule matched, `None` for the
    /// default-deny fallback.
    pub matched_policy: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl Decision {
    pub fn default_deny() -> Self {
        Self {
            effect: Effect::Deny,
            matched_policy: None,
            evaluated_at: Utc::now(),
        }
    }
}
