//! Reference plugin: sliding-window rate limiter, per agent and per
//! `(agent_id, tool_name)`.
//!
//! The read-window / decide / append-on-success sequence is exactly the
//! time-of-check/time-of-use hazard the engine's single mutex closes (spec.md
//! §5): `before_check` reads the window and decides, `after_decision`
//! appends the timestamp only when the request was not denied, and no other
//! plugin or evaluation step runs between the two for the same request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::plugin::{AfterDecisionOutcome, BeforeCheckOutcome, Plugin, PluginError};
use crate::schema::{AgentActionRequest, Decision, Outcome, Reason};

const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Configuration for [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub max_per_agent: usize,
    pub max_per_agent_tool: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_WINDOW_MS),
            max_per_agent: 100,
            max_per_agent_tool: 20,
        }
    }
}

#[derive(Default)]
struct Windows {
    per_agent: HashMap<String, Vec<Instant>>,
    per_agent_tool: HashMap<(String, String), Vec<Instant>>,
}

/// A sliding-window rate limiter keyed on `agent_id` and on
/// `(agent_id, tool_name)`. Denies with `RATE_LIMIT_AGENT` or
/// `RATE_LIMIT_TOOL` when the relevant window is already at capacity;
/// otherwise lets the request proceed and — only once the final decision is
/// not a denial — records the timestamp that counts against future windows.
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    fn prune(entries: &mut Vec<Instant>, window: Duration, now: Instant) {
        entries.retain(|t| now.duration_since(*t) <= window);
    }
}

#[async_trait]
impl Plugin for RateLimiter {
    fn name(&self) -> &str {
        "rate-limiter"
    }

    async fn before_check(&self, request: &AgentActionRequest) -> Result<BeforeCheckOutcome, PluginError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");

        let agent_entries = windows.per_agent.entry(request.agent.agent_id.clone()).or_default();
        Self::prune(agent_entries, self.config.window, now);
        if agent_entries.len() >= self.config.max_per_agent {
            return Ok(BeforeCheckOutcome::Decide(Decision::deny(Reason::new(
                "RATE_LIMIT_AGENT",
                format!(
                    "agent {} exceeded {} requests in the current window",
                    request.agent.agent_id, self.config.max_per_agent
                ),
            ))));
        }

        let tool_key = (request.agent.agent_id.clone(), request.action.tool_name.clone());
        let tool_entries = windows.per_agent_tool.entry(tool_key).or_default();
        Self::prune(tool_entries, self.config.window, now);
        if tool_entries.len() >= self.config.max_per_agent_tool {
            return Ok(BeforeCheckOutcome::Decide(Decision::deny(Reason::new(
                "RATE_LIMIT_TOOL",
                format!(
                    "agent {} exceeded {} calls to {} in the current window",
                    request.agent.agent_id, self.config.max_per_agent_tool, request.action.tool_name
                ),
            ))));
        }

        Ok(BeforeCheckOutcome::Continue)
    }

    async fn after_decision(
        &self,
        request: &AgentActionRequest,
        decision: &Decision,
    ) -> Result<AfterDecisionOutcome, PluginError> {
        if decision.outcome == Outcome::Deny {
            return Ok(AfterDecisionOutcome::Continue);
        }
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        windows
            .per_agent
            .entry(request.agent.agent_id.clone())
            .or_default()
            .push(now);
        windows
            .per_agent_tool
            .entry((request.agent.agent_id.clone(), request.action.tool_name.clone()))
            .or_default()
            .push(now);
        Ok(AfterDecisionOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ActionRequest, AgentIdentity, Decision as SchemaDecision, RequestContext};
    use std::collections::BTreeMap;

    fn request(agent_id: &str, tool: &str) -> AgentActionRequest {
        AgentActionRequest {
            request_id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            agent: AgentIdentity {
                agent_id: agent_id.to_string(),
                name: None,
                owner: None,
                environment: "prod".to_string(),
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
                tool_args: BTreeMap::new(),
                tool_identity: None,
                tool_provider: None,
            },
            context: RequestContext::default(),
        }
    }

    #[tokio::test]
    async fn denies_once_per_tool_capacity_reached() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(60),
            max_per_agent: 100,
            max_per_agent_tool: 2,
        });

        for _ in 0..2 {
            let req = request("agent-1", "search");
            let outcome = limiter.before_check(&req).await.unwrap();
            assert!(matches!(outcome, BeforeCheckOutcome::Continue));
            limiter
                .after_decision(&req, &SchemaDecision::allow(Reason::new("x", "x")))
                .await
                .unwrap();
        }

        let req = request("agent-1", "search");
        let outcome = limiter.before_check(&req).await.unwrap();
        match outcome {
            BeforeCheckOutcome::Decide(decision) => assert_eq!(decision.reasons[0].code, "RATE_LIMIT_TOOL"),
            _ => panic!("expected rate-limit denial"),
        }
    }

    #[tokio::test]
    async fn denied_requests_do_not_count_against_the_window() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(60),
            max_per_agent: 100,
            max_per_agent_tool: 1,
        });

        let req = request("agent-1", "search");
        limiter.before_check(&req).await.unwrap();
        limiter
            .after_decision(&req, &SchemaDecision::deny(Reason::new("DENY", "x")))
            .await
            .unwrap();

        // Denied request never recorded a timestamp, so capacity is still available.
        let outcome = limiter.before_check(&req).await.unwrap();
        assert!(matches!(outcome, BeforeCheckOutcome::Continue));
    }

    #[tokio::test]
    async fn different_agents_have_independent_windows() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(60),
            max_per_agent: 1,
            max_per_agent_tool: 100,
        });

        let req_a = request("agent-a", "search");
        limiter.before_check(&req_a).await.unwrap();
        limiter
            .after_decision(&req_a, &SchemaDecision::allow(Reason::new("x", "x")))
            .await
            .unwrap();

        let req_b = request("agent-b", "search");
        let outcome = limiter.before_check(&req_b).await.unwrap();
        assert!(matches!(outcome, BeforeCheckOutcome::Continue));
    }
}
