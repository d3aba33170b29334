//! Event builder (C7): request + decision → audit event with a redacted
//! payload.
//!
//! Grounded on `mcp::decision::DecisionEvent::new` (fresh id, current
//! timestamp, builder-style construction) from the teacher. The safe-payload
//! restriction is enforced at the type level here rather than by
//! convention: `build_event` never receives the full request by move, only
//! borrows the four fields it is allowed to copy, so there is no code path
//! through which `tool_args` or `user_input` could end up on the wire.

use uuid::Uuid;

use crate::schema::{AgentActionRequest, Decision, Event, EventOutcome, Reason, SafePayload};

/// Builds the primary (or a plugin-attributed secondary) audit event for one
/// decision.
pub fn build_event(
    request: &AgentActionRequest,
    decision: &Decision,
    plugin_source: Option<String>,
) -> Event {
    build_event_with_outcome(request, decision.outcome.into(), decision.reasons.clone(), plugin_source)
}

/// Builds an event with an outcome and reasons that don't come directly
/// from a `Decision` — used for resolution-phase secondary events
/// (`APPROVED`, `REJECTED`, `APPROVAL_TIMEOUT`, ...).
pub fn build_event_with_outcome(
    request: &AgentActionRequest,
    outcome: EventOutcome,
    reasons: Vec<Reason>,
    plugin_source: Option<String>,
) -> Event {
    Event {
        event_id: Uuid::new_v4(),
        timestamp: chrono::Utc::now(),
        request_id: request.request_id,
        agent_id: request.agent.agent_id.clone(),
        tool_name: request.action.tool_name.clone(),
        outcome,
        reasons,
        safe_payload: SafePayload {
            agent_id: request.agent.agent_id.clone(),
            tool_name: request.action.tool_name.clone(),
            environment: request.agent.environment.clone(),
            outcome,
        },
        plugin_source,
    }
}
