//! First-match policy evaluator (C3).
//!
//! Grounded on the teacher-adjacent `RuleBasedEngine::evaluate` pattern
//! (declaration-order iteration under a read lock, first match wins, default
//! decision on no match) from `other_examples`' `agent-policy-src-engine.rs`,
//! combined with the teacher's own ordered-check style in
//! `runtime::authorizer::Authorizer::authorize_and_consume`.

use crate::regex_cache::{RegexCache, RegexDiagnostic};
use crate::schema::{
    AgentActionRequest, Decision, MatchClause, OneOrMany, PolicyBundle, PolicyRule, Reason,
    ToolArgMatch, TrustLevel, WhenClause,
};
use crate::value::Value;

/// Owns the current bundle and its derived regex cache. Not `Send`/`Sync`
/// on its own merit — the engine wraps it in a mutex so the whole pipeline
/// (evaluation included) is serialized per the concurrency model in §5.
pub struct Evaluator {
    bundle: PolicyBundle,
    regex_cache: RegexCache,
}

impl Evaluator {
    /// Builds an evaluator from an already-validated bundle, pre-compiling
    /// every `matches_regex` pattern and collecting diagnostics for any that
    /// are rejected.
    pub fn new(bundle: PolicyBundle) -> (Self, Vec<RegexDiagnostic>) {
        let mut evaluator = Self {
            bundle,
            regex_cache: RegexCache::new(),
        };
        let diagnostics = evaluator.precompile_regexes();
        (evaluator, diagnostics)
    }

    fn precompile_regexes(&mut self) -> Vec<RegexDiagnostic> {
        let mut diagnostics = Vec::new();
        for rule in &self.bundle.rules {
            if let Some(when) = &rule.when {
                if let Some(pattern) = &when.matches_regex {
                    if let Some(diag) = self.regex_cache.precompile(&rule.id, pattern) {
                        diagnostics.push(diag);
                    }
                }
            }
        }
        diagnostics
    }

    /// Atomically swaps in a new bundle and clears the regex cache (spec
    /// invariant: after `update_bundle` the cache contains no entries from
    /// the prior bundle). Returns diagnostics for the new bundle's patterns.
    pub fn update_bundle(&mut self, bundle: PolicyBundle) -> Vec<RegexDiagnostic> {
        self.bundle = bundle;
        self.regex_cache.clear();
        self.precompile_regexes()
    }

    pub fn bundle(&self) -> &PolicyBundle {
        &self.bundle
    }

    /// Runs the first-match evaluation described in §4.2 against `request`.
    pub fn evaluate(&mut self, request: &AgentActionRequest) -> Decision {
        let searchable = searchable_values(request);
        let searchable_text = searchable.join(" ");

        for rule in &self.bundle.rules {
            if !matches_rule(rule, request, &searchable, &searchable_text, &mut self.regex_cache) {
                continue;
            }
            return Decision {
                outcome: rule.outcome,
                reasons: vec![Reason::new(rule.id.clone(), rule.description.clone())],
                approver_role: rule.approver_role.clone(),
                constraints: rule.constraints.clone(),
            };
        }

        let outcome = self.bundle.defaults.outcome;
        let code = format!("DEFAULT_{}", outcome_code(outcome));
        Decision {
            outcome,
            reasons: vec![Reason::new(code, "no rule matched; applying bundle default".to_string())],
            approver_role: None,
            constraints: None,
        }
    }
}

fn outcome_code(outcome: crate::schema::Outcome) -> &'static str {
    use crate::schema::Outcome;
    match outcome {
        Outcome::Allow => "ALLOW",
        Outcome::Deny => "DENY",
        Outcome::RequireApproval => "REQUIRE_APPROVAL",
        Outcome::StepUp => "STEP_UP",
        Outcome::RequireTicket => "REQUIRE_TICKET",
        Outcome::RequireHuman => "REQUIRE_HUMAN",
    }
}

fn matches_rule(
    rule: &PolicyRule,
    request: &AgentActionRequest,
    searchable: &[String],
    searchable_text: &str,
    regex_cache: &mut RegexCache,
) -> bool {
    matches_match_clause(&rule.match_clause, request)
        && rule
            .when
            .as_ref()
            .is_none_or(|when| matches_when_clause(when, request, searchable, searchable_text, regex_cache))
}

fn matches_match_clause(clause: &MatchClause, request: &AgentActionRequest) -> bool {
    if !matches_tool_name(&clause.tool_name, &request.action.tool_name) {
        return false;
    }
    if clause.environment != "*" && clause.environment != request.agent.environment {
        return false;
    }
    if let Some(agent_type_match) = &clause.agent_type {
        match &request.agent.agent_type {
            Some(actual) => {
                if !one_or_many_contains(agent_type_match, actual) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(min) = clause.trust_level_min {
        match request.agent.trust_level {
            Some(actual) if actual >= min => {}
            _ => return false,
        }
    }
    if !clause.agent_roles_any.is_empty() {
        let has_overlap = clause
            .agent_roles_any
            .iter()
            .any(|role| request.agent.roles.iter().any(|r| r == role));
        if !has_overlap {
            return false;
        }
    }
    if let Some(provider_match) = &clause.tool_provider {
        match &request.action.tool_provider {
            Some(actual) => {
                if !one_or_many_contains(provider_match, actual) {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}

fn one_or_many_contains(matcher: &OneOrMany, actual: &str) -> bool {
    matcher.iter().any(|v| v == actual)
}

/// `"*"` matches anything; a sequence is membership; a trailing-`*` glob is
/// a prefix match (prefix must be non-empty); anything else is exact
/// equality. Embedded/non-trailing globs are treated as literal characters
/// — an explicit preserved ambiguity, not extended semantics.
fn matches_tool_name(matcher: &OneOrMany, tool_name: &str) -> bool {
    match matcher {
        OneOrMany::One(pattern) => matches_tool_name_pattern(pattern, tool_name),
        OneOrMany::Many(patterns) => patterns.iter().any(|p| matches_tool_name_pattern(p, tool_name)),
    }
}

fn matches_tool_name_pattern(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if !prefix.is_empty() {
            return tool_name.starts_with(prefix);
        }
    }
    pattern == tool_name
}

fn matches_when_clause(
    when: &WhenClause,
    request: &AgentActionRequest,
    searchable: &[String],
    searchable_text: &str,
    regex_cache: &mut RegexCache,
) -> bool {
    if !when.contains_any.is_empty() {
        let any_present = when
            .contains_any
            .iter()
            .any(|term| contains_case_insensitive(searchable, term));
        if !any_present {
            return false;
        }
    }

    if !when.not_contains.is_empty() {
        let any_present = when
            .not_contains
            .iter()
            .any(|term| contains_case_insensitive(searchable, term));
        if any_present {
            return false;
        }
    }

    if let Some(pattern) = &when.matches_regex {
        match regex_cache.get(pattern) {
            Some(re) => {
                if !re.is_match(searchable_text) {
                    return false;
                }
            }
            None => return false, // unsafe/rejected pattern: fail-closed for this condition
        }
    }

    if !when.data_labels_any.is_empty() {
        let has_overlap = when
            .data_labels_any
            .iter()
            .any(|label| request.context.data_labels.iter().any(|l| l == label));
        if !has_overlap {
            return false;
        }
    }

    for (key, expected) in &when.tool_args_match {
        let actual = request.action.tool_args.get(key);
        if !matches_tool_arg(expected, actual) {
            return false;
        }
    }

    true
}

fn contains_case_insensitive(haystack: &[String], term: &str) -> bool {
    let needle = term.to_lowercase();
    haystack.iter().any(|s| s.to_lowercase().contains(&needle))
}

fn matches_tool_arg(expected: &ToolArgMatch, actual: Option<&Value>) -> bool {
    match expected {
        ToolArgMatch::Literal(expected_value) => actual == Some(expected_value),
        ToolArgMatch::Comparator(comparator) => {
            let actual = match actual {
                Some(v) => v,
                None => return false,
            };
            if let Some(gt) = comparator.gt {
                if actual.as_f64().is_none_or(|n| !(n > gt)) {
                    return false;
                }
            }
            if let Some(gte) = comparator.gte {
                if actual.as_f64().is_none_or(|n| !(n >= gte)) {
                    return false;
                }
            }
            if let Some(lt) = comparator.lt {
                if actual.as_f64().is_none_or(|n| !(n < lt)) {
                    return false;
                }
            }
            if let Some(lte) = comparator.lte {
                if actual.as_f64().is_none_or(|n| !(n <= lte)) {
                    return false;
                }
            }
            if let Some(eq) = &comparator.eq {
                if actual != eq {
                    return false;
                }
            }
            if let Some(neq) = &comparator.neq {
                if actual == neq {
                    return false;
                }
            }
            true
        }
    }
}

/// Flattens `context.user_input` and `tool_args` into a sequence of leaf
/// string values. This is the only source of text for `contains_any`,
/// `not_contains`, and `matches_regex`.
pub fn searchable_values(request: &AgentActionRequest) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(user_input) = &request.context.user_input {
        out.push(user_input.clone());
    }
    for value in request.action.tool_args.values() {
        value.flatten_into(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::*;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn bundle_with_rules(rules: Vec<PolicyRule>, default_outcome: Outcome) -> PolicyBundle {
        PolicyBundle {
            version: "1".to_string(),
            generated_at: Utc::now() - Duration::hours(1),
            expires_at: Utc::now() + Duration::hours(1),
            rules,
            defaults: Defaults { outcome: default_outcome },
            signature: None,
        }
    }

    fn rule(id: &str, tool: &str, env: &str, outcome: Outcome) -> PolicyRule {
        PolicyRule {
            id: id.to_string(),
            description: String::new(),
            match_clause: MatchClause {
                tool_name: OneOrMany::One(tool.to_string()),
                environment: env.to_string(),
                agent_type: None,
                trust_level_min: None,
                agent_roles_any: vec![],
                tool_provider: None,
            },
            when: None,
            outcome,
            approver_role: None,
            constraints: None,
        }
    }

    fn request(tool: &str, env: &str, tool_args: BTreeMap<String, Value>) -> AgentActionRequest {
        AgentActionRequest {
            request_id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            agent: AgentIdentity {
                agent_id: "agent-1".to_string(),
                name: None,
                owner: None,
                environment: env.to_string(),
                agent_type: None,
                trust_level: None,
                roles: vec![],
                capabilities: vec![],
                max_delegation_depth: None,
                attestation: None,
            },
            action: ActionRequest {
                action_type: None,
                tool_name: tool.to_string(),
                tool_args,
                tool_identity: None,
                tool_provider: None,
            },
            context: RequestContext::default(),
        }
    }

    #[test]
    fn scenario_1_empty_rules_uses_default() {
        let (mut eval, _) = Evaluator::new(bundle_with_rules(vec![], Outcome::Allow));
        let decision = eval.evaluate(&request("any", "dev", BTreeMap::new()));
        assert_eq!(decision.outcome, Outcome::Allow);
        assert_eq!(decision.reasons[0].code, "DEFAULT_ALLOW");
    }

    #[test]
    fn scenario_2_exact_tool_and_wildcard_env_denies() {
        let rules = vec![rule("r1", "bad", "*", Outcome::Deny)];
        let (mut eval, _) = Evaluator::new(bundle_with_rules(rules, Outcome::Allow));
        let decision = eval.evaluate(&request("bad", "dev", BTreeMap::new()));
        assert_eq!(decision.outcome, Outcome::Deny);
    }

    #[test]
    fn scenario_3_trailing_glob_denies() {
        let rules = vec![rule("r1", "query_*", "*", Outcome::Deny)];
        let (mut eval, _) = Evaluator::new(bundle_with_rules(rules, Outcome::Allow));
        let decision = eval.evaluate(&request("query_orders", "dev", BTreeMap::new()));
        assert_eq!(decision.outcome, Outcome::Deny);
    }

    #[test]
    fn scenario_4_sequence_membership_and_env_match() {
        let mut r = rule("r1", "pay", "prod", Outcome::RequireApproval);
        r.match_clause.tool_name = OneOrMany::Many(vec!["pay".to_string(), "refund".to_string()]);
        let (mut eval, _) = Evaluator::new(bundle_with_rules(vec![r], Outcome::Allow));
        let decision = eval.evaluate(&request("refund", "prod", BTreeMap::new()));
        assert_eq!(decision.outcome, Outcome::RequireApproval);
    }

    #[test]
    fn scenario_5_env_mismatch_falls_through_to_default() {
        let rules = vec![rule("r1", "export", "prod", Outcome::Deny)];
        let (mut eval, _) = Evaluator::new(bundle_with_rules(rules, Outcome::Allow));
        let decision = eval.evaluate(&request("export", "dev", BTreeMap::new()));
        assert_eq!(decision.outcome, Outcome::Allow);
    }

    #[test]
    fn scenario_6_contains_any_on_tool_args_denies() {
        let mut r = rule("r1", "query_db", "*", Outcome::Deny);
        r.when = Some(WhenClause {
            contains_any: vec!["SELECT *".to_string()],
            ..Default::default()
        });
        let (mut eval, _) = Evaluator::new(bundle_with_rules(vec![r], Outcome::Allow));
        let mut args = BTreeMap::new();
        args.insert("sql".to_string(), Value::String("SELECT * FROM users".to_string()));
        let decision = eval.evaluate(&request("query_db", "dev", args));
        assert_eq!(decision.outcome, Outcome::Deny);
    }

    #[test]
    fn scenario_7_numeric_gt_comparator_requires_approval() {
        let mut r = rule("r1", "pay", "*", Outcome::RequireApproval);
        let mut tool_args_match = BTreeMap::new();
        tool_args_match.insert(
            "amount".to_string(),
            ToolArgMatch::Comparator(Comparator {
                gt: Some(1000.0),
                gte: None,
                lt: None,
                lte: None,
                eq: None,
                neq: None,
            }),
        );
        r.when = Some(WhenClause {
            tool_args_match,
            ..Default::default()
        });
        let (mut eval, _) = Evaluator::new(bundle_with_rules(vec![r], Outcome::Allow));
        let mut args = BTreeMap::new();
        args.insert("amount".to_string(), Value::Number(1500.0));
        let decision = eval.evaluate(&request("pay", "dev", args));
        assert_eq!(decision.outcome, Outcome::RequireApproval);
    }

    #[test]
    fn scenario_8_unsafe_regex_fails_closed_to_default() {
        let mut r = rule("r1", "x", "*", Outcome::Deny);
        r.when = Some(WhenClause {
            matches_regex: Some("(a+)+".to_string()),
            ..Default::default()
        });
        let (mut eval, diagnostics) = Evaluator::new(bundle_with_rules(vec![r], Outcome::Allow));
        assert_eq!(diagnostics.len(), 1);
        let mut args = BTreeMap::new();
        args.insert("in".to_string(), Value::String("aaaaaa".to_string()));
        let decision = eval.evaluate(&request("x", "dev", args));
        assert_eq!(decision.outcome, Outcome::Allow);
    }

    #[test]
    fn first_match_wins_even_when_a_later_rule_would_also_match() {
        let rules = vec![
            rule("first", "tool", "*", Outcome::Allow),
            rule("second", "tool", "*", Outcome::Deny),
        ];
        let (mut eval, _) = Evaluator::new(bundle_with_rules(rules, Outcome::Deny));
        let decision = eval.evaluate(&request("tool", "dev", BTreeMap::new()));
        assert_eq!(decision.outcome, Outcome::Allow);
        assert_eq!(decision.reasons[0].code, "first");
    }

    #[test]
    fn update_bundle_clears_prior_regex_cache_entries() {
        let mut r = rule("r1", "x", "*", Outcome::Deny);
        r.when = Some(WhenClause {
            matches_regex: Some("abc".to_string()),
            ..Default::default()
        });
        let (mut eval, _) = Evaluator::new(bundle_with_rules(vec![r], Outcome::Allow));
        assert!(eval.regex_cache.get("abc").is_some());
        eval.update_bundle(bundle_with_rules(vec![], Outcome::Allow));
        assert!(eval.regex_cache.is_empty());
    }

    #[test]
    fn trust_level_minimum_requires_ordered_comparison() {
        let mut r = rule("r1", "admin_tool", "*", Outcome::RequireApproval);
        r.match_clause.trust_level_min = Some(TrustLevel::Privileged);
        let (mut eval, _) = Evaluator::new(bundle_with_rules(vec![r], Outcome::Allow));

        let mut req = request("admin_tool", "dev", BTreeMap::new());
        req.agent.trust_level = Some(TrustLevel::Basic);
        assert_eq!(eval.evaluate(&req).outcome, Outcome::Allow);

        req.agent.trust_level = Some(TrustLevel::System);
        assert_eq!(eval.evaluate(&req).outcome, Outcome::RequireApproval);
    }
}
