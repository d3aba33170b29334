//! Plugin contract (C4): a capability interface with optional hooks,
//! dispatched through a stable table rather than structural typing.
//!
//! Grounded on the teacher's `mcp::decision::DecisionEmitter` trait shape
//! (a small `Send + Sync` trait object held in `Arc`) and on the
//! `#[async_trait] trait PolicyEngine` pattern from `other_examples`'
//! `agent-policy-src-engine.rs`.

use async_trait::async_trait;

use crate::schema::{AgentActionRequest, Decision};

/// Outcome of a `beforeCheck` hook.
pub enum BeforeCheckOutcome {
    /// Proceed to the next plugin / to evaluation unchanged.
    Continue,
    /// Replace the in-flight request; subsequent plugins and the evaluator
    /// see only the modified view (copy-on-modify, never a mutation in
    /// place).
    ModifiedRequest(AgentActionRequest),
    /// Short-circuit the pipeline with this decision, attributed to the
    /// plugin that produced it.
    Decide(Decision),
}

/// Outcome of an `afterDecision` hook.
pub enum AfterDecisionOutcome {
    Continue,
    Override(Decision),
}

/// Error raised by any plugin hook. The engine never propagates this to the
/// caller — it is reported via `on_error` and then handled per the
/// plugin's `fail_open()` flag.
#[derive(Debug, thiserror::Error)]
#[error("plugin error: {0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A host-supplied capability that participates in pipeline phases.
///
/// Every hook is optional; the default implementation is a no-op so a
/// plugin only needs to override the phases it cares about. Hooks are
/// invoked in declaration order by the engine, which holds its mutex across
/// every suspension point here — plugins may therefore use plain,
/// non-synchronized internal storage (see §5 of the design notes).
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique within a single engine instance.
    fn name(&self) -> &str;

    fn version(&self) -> Option<&str> {
        None
    }

    /// `false` (default) ⇒ a hook error becomes a synthesized DENY decision
    /// (`PLUGIN_ERROR`). `true` ⇒ the error is swallowed and the pipeline
    /// continues. Security-critical plugins must leave this at the default.
    fn fail_open(&self) -> bool {
        false
    }

    async fn initialize(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn before_check(&self, _request: &AgentActionRequest) -> Result<BeforeCheckOutcome, PluginError> {
        Ok(BeforeCheckOutcome::Continue)
    }

    async fn after_decision(
        &self,
        _request: &AgentActionRequest,
        _decision: &Decision,
    ) -> Result<AfterDecisionOutcome, PluginError> {
        Ok(AfterDecisionOutcome::Continue)
    }

    /// Side-effect only: invoked after the protected call runs (or fails to
    /// run), win or lose. Errors here are logged via `on_error` and never
    /// propagate — the tool already ran.
    async fn after_execution(
        &self,
        _request: &AgentActionRequest,
        _decision: &Decision,
        _result: Option<&str>,
        _error: Option<&str>,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), PluginError> {
        Ok(())
    }
}
