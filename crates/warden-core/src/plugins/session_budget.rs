//! Reference plugin: per-session, per-tool call budgets with TTL expiry.
//!
//! `before_check` denies once a tool's count for the session equals
//! `max_per_session`; `after_decision` increments the counter only on
//! non-`DENY` decisions, matching the rate limiter's read-decide-record
//! split. Session records expire `ttl` after their last touch; expiry is
//! swept lazily on each `before_check` plus an optional background task the
//! host can start with [`SessionBudget::spawn_background_cleanup`], which is
//! cancelled by `destroy()`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::plugin::{AfterDecisionOutcome, BeforeCheckOutcome, Plugin, PluginError};
use crate::schema::{AgentActionRequest, Decision, Outcome, Reason};

const DEFAULT_MAX_PER_SESSION: u32 = 50;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct SessionRecord {
    counts: HashMap<String, u32>,
    last_touched: Instant,
}

struct State {
    sessions: HashMap<String, SessionRecord>,
    cleanup_task: Option<JoinHandle<()>>,
}

/// Per-session, per-tool call counters, owned by the engine's serialized
/// pipeline. `max_per_session` applies independently to each tool name
/// within a session (not to the session's total call count across tools).
pub struct SessionBudget {
    max_per_session: u32,
    ttl: Duration,
    state: Mutex<State>,
}

impl SessionBudget {
    pub fn new(max_per_session: u32, ttl: Duration) -> Self {
        Self {
            max_per_session,
            ttl,
            state: Mutex::new(State {
                sessions: HashMap::new(),
                cleanup_task: None,
            }),
        }
    }

    /// Starts a background task that periodically sweeps expired sessions.
    /// Idempotent: calling it twice replaces (and aborts) the prior task.
    /// Cancelled by `destroy()`, so it never outlives the plugin.
    pub fn spawn_background_cleanup(self: &std::sync::Arc<Self>, period: Duration) {
        let weak = std::sync::Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(budget) => budget.sweep_expired(),
                    None => break,
                }
            }
        });
        let mut state = self.state.lock().expect("session budget mutex poisoned");
        if let Some(old) = state.cleanup_task.replace(handle) {
            old.abort();
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut state = self.state.lock().expect("session budget mutex poisoned");
        state.sessions.retain(|_, record| now.duration_since(record.last_touched) <= ttl);
    }

    fn session_key(request: &AgentActionRequest) -> Option<String> {
        request.context.session_id.clone()
    }
}

#[async_trait]
impl Plugin for SessionBudget {
    fn name(&self) -> &str {
        "session-budget"
    }

    async fn before_check(&self, request: &AgentActionRequest) -> Result<BeforeCheckOutcome, PluginError> {
        let Some(session_id) = Self::session_key(request) else {
            return Ok(BeforeCheckOutcome::Continue);
        };

        let now = Instant::now();
        let mut state = self.state.lock().expect("session budget mutex poisoned");
        state.sessions.retain(|_, record| now.duration_since(record.last_touched) <= self.ttl);

        let count = state
            .sessions
            .get(&session_id)
            .and_then(|record| record.counts.get(&request.action.tool_name))
            .copied()
            .unwrap_or(0);

        if count >= self.max_per_session {
            return Ok(BeforeCheckOutcome::Decide(Decision::deny(Reason::new(
                "SESSION_LIMIT_EXCEEDED",
                format!(
                    "session {session_id} reached the limit of {} calls to {}",
                    self.max_per_session, request.action.tool_name
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
        let Some(session_id) = Self::session_key(request) else {
            return Ok(AfterDecisionOutcome::Continue);
        };

        let now = Instant::now();
        let mut state = self.state.lock().expect("session budget mutex poisoned");
        let record = state.sessions.entry(session_id).or_insert_with(|| SessionRecord {
            counts: HashMap::new(),
            last_touched: now,
        });
        *record.counts.entry(request.action.tool_name.clone()).or_insert(0) += 1;
        record.last_touched = now;
        Ok(AfterDecisionOutcome::Continue)
    }

    async fn destroy(&self) -> Result<(), PluginError> {
        let mut state = self.state.lock().expect("session budget mutex poisoned");
        if let Some(task) = state.cleanup_task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Default for SessionBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_SESSION, DEFAULT_TTL)
    }
}
