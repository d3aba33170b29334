//! Typed request, rule, bundle, decision, and event records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// Ordered trust domain: `untrusted < basic < verified < privileged < system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    Basic,
    Verified,
    Privileged,
    System,
}

impl TrustLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Basic => "basic",
            TrustLevel::Verified => "verified",
            TrustLevel::Privileged => "privileged",
            TrustLevel::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "untrusted" => Some(TrustLevel::Untrusted),
            "basic" => Some(TrustLevel::Basic),
            "verified" => Some(TrustLevel::Verified),
            "privileged" => Some(TrustLevel::Privileged),
            "system" => Some(TrustLevel::System),
            _ => None,
        }
    }
}

/// Identity and posture of the agent making the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    pub environment: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub max_delegation_depth: Option<u32>,
    #[serde(default)]
    pub attestation: Option<Value>,
}

/// The proposed tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(rename = "type", default)]
    pub action_type: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: BTreeMap<String, Value>,
    #[serde(default)]
    pub tool_identity: Option<String>,
    #[serde(default)]
    pub tool_provider: Option<String>,
}

/// Ambient request context: user text, data labels, session/delegation info.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub user_input: Option<String>,
    #[serde(default)]
    pub data_labels: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_agent_id: Option<String>,
    #[serde(default)]
    pub delegation_chain: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Immutable input to `Engine::check`. Never mutated after construction;
/// plugins that want to change what downstream stages see must produce a
/// new `AgentActionRequest` value (copy-on-modify).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentActionRequest {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub agent: AgentIdentity,
    pub action: ActionRequest,
    #[serde(default)]
    pub context: RequestContext,
}

impl AgentActionRequest {
    /// Structural invariant from the data model: these three fields must be
    /// non-empty. The loader and engine call this before doing anything else
    /// with a freshly built request.
    pub fn validate_non_empty(&self) -> Result<(), String> {
        if self.agent.agent_id.trim().is_empty() {
            return Err("agent_id must not be empty".to_string());
        }
        if self.agent.environment.trim().is_empty() {
            return Err("environment must not be empty".to_string());
        }
        if self.action.tool_name.trim().is_empty() {
            return Err("tool_name must not be empty".to_string());
        }
        Ok(())
    }
}

/// One or many strings — the shape `PolicyRule.match.tool_name` and siblings
/// accept on the wire (`"x"` or `["x", "y"]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn iter(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match self {
            OneOrMany::One(s) => Box::new(std::iter::once(s.as_str())),
            OneOrMany::Many(items) => Box::new(items.iter().map(String::as_str)),
        }
    }
}

/// A single comparator object inside `tool_args_match`, e.g. `{"gt": 1000}`.
/// AND-combined: every key present in the object must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparator {
    #[serde(default)]
    pub gt: Option<f64>,
    #[serde(default)]
    pub gte: Option<f64>,
    #[serde(default)]
    pub lt: Option<f64>,
    #[serde(default)]
    pub lte: Option<f64>,
    #[serde(default)]
    pub eq: Option<Value>,
    #[serde(default)]
    pub neq: Option<Value>,
}

impl Comparator {
    fn has_any_operator(&self) -> bool {
        self.gt.is_some()
            || self.gte.is_some()
            || self.lt.is_some()
            || self.lte.is_some()
            || self.eq.is_some()
            || self.neq.is_some()
    }
}

/// Either a literal expected value, or a comparator object. Disambiguated on
/// deserialize by the presence of any of the six operator keys.
#[derive(Debug, Clone)]
pub enum ToolArgMatch {
    Literal(Value),
    Comparator(Comparator),
}

impl<'de> Deserialize<'de> for ToolArgMatch {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        if let serde_json::Value::Object(ref map) = value {
            let looks_like_comparator = ["gt", "gte", "lt", "lte", "eq", "neq"]
                .iter()
                .any(|k| map.contains_key(*k));
            if looks_like_comparator {
                let comparator: Comparator =
                    serde_json::from_value(value.clone()).map_err(serde::de::Error::custom)?;
                if comparator.has_any_operator() {
                    return Ok(ToolArgMatch::Comparator(comparator));
                }
            }
        }
        Ok(ToolArgMatch::Literal(value.into()))
    }
}

impl Serialize for ToolArgMatch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ToolArgMatch::Literal(v) => v.serialize(serializer),
            ToolArgMatch::Comparator(c) => c.serialize(serializer),
        }
    }
}

/// `PolicyRule.match` — the ordered matcher fields (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchClause {
    pub tool_name: OneOrMany,
    pub environment: String,
    #[serde(default)]
    pub agent_type: Option<OneOrMany>,
    #[serde(default)]
    pub trust_level_min: Option<TrustLevel>,
    #[serde(default)]
    pub agent_roles_any: Vec<String>,
    #[serde(default)]
    pub tool_provider: Option<OneOrMany>,
}

/// `PolicyRule.when` — the guarded predicate block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhenClause {
    #[serde(default)]
    pub contains_any: Vec<String>,
    #[serde(default)]
    pub not_contains: Vec<String>,
    #[serde(default)]
    pub matches_regex: Option<String>,
    #[serde(default)]
    pub data_labels_any: Vec<String>,
    #[serde(default)]
    pub tool_args_match: BTreeMap<String, ToolArgMatch>,
}

/// The closed decision outcome set (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Allow,
    Deny,
    RequireApproval,
    StepUp,
    RequireTicket,
    RequireHuman,
}

/// Event outcomes extend `Outcome` with resolution/terminal markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventOutcome {
    Allow,
    Deny,
    RequireApproval,
    StepUp,
    RequireTicket,
    RequireHuman,
    Approved,
    Rejected,
    KillSwitch,
    RateLimited,
    Timeout,
}

impl From<Outcome> for EventOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Allow => EventOutcome::Allow,
            Outcome::Deny => EventOutcome::Deny,
            Outcome::RequireApproval => EventOutcome::RequireApproval,
            Outcome::StepUp => EventOutcome::StepUp,
            Outcome::RequireTicket => EventOutcome::RequireTicket,
            Outcome::RequireHuman => EventOutcome::RequireHuman,
        }
    }
}

/// A single policy rule: match clause, optional guard, outcome, metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "match")]
    pub match_clause: MatchClause,
    #[serde(default)]
    pub when: Option<WhenClause>,
    pub outcome: Outcome,
    #[serde(default)]
    pub approver_role: Option<String>,
    #[serde(default)]
    pub constraints: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    pub outcome: Outcome,
}

/// A validated, optionally-signed policy artifact. Frozen once accepted by
/// the loader — updates go through `Evaluator::update_bundle`, which clears
/// the derived regex cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBundle {
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rules: Vec<PolicyRule>,
    pub defaults: Defaults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// A single reason attached to a decision or event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reason {
    pub code: String,
    pub message: String,
}

impl Reason {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The evaluator/engine's output for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub reasons: Vec<Reason>,
    #[serde(default)]
    pub approver_role: Option<String>,
    #[serde(default)]
    pub constraints: Option<Value>,
}

impl Decision {
    pub fn allow(reason: Reason) -> Self {
        Self {
            outcome: Outcome::Allow,
            reasons: vec![reason],
            approver_role: None,
            constraints: None,
        }
    }

    pub fn deny(reason: Reason) -> Self {
        Self {
            outcome: Outcome::Deny,
            reasons: vec![reason],
            approver_role: None,
            constraints: None,
        }
    }
}

/// Redacted summary included on every event. Never carries `tool_args` or
/// `user_input` — only these four fields, by construction (see `event`
/// module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafePayload {
    pub agent_id: String,
    pub tool_name: String,
    pub environment: String,
    pub outcome: EventOutcome,
}

/// The audit record emitted per decision (and per resolution outcome).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub agent_id: String,
    pub tool_name: String,
    pub outcome: EventOutcome,
    pub reasons: Vec<Reason>,
    pub safe_payload: SafePayload,
    #[serde(default)]
    pub plugin_source: Option<String>,
}
