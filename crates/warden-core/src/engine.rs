//! Engine (C5): pipeline orchestration, mutex, audit ring, decision
//! resolution.
//!
//! The mutex-across-suspension-points design is grounded on the teacher's
//! single-writer store pattern in `runtime::mandate_store` (atomic
//! read-decide-write under one guard), generalized here to cover the bundle
//! reference, the regex cache, and the audit log together, exactly as the
//! concurrency model in the spec requires.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::{EngineError, LoaderError, SecurityBlockedError};
use crate::evaluator::Evaluator;
use crate::event::{build_event, build_event_with_outcome};
use crate::loader::{self, LoaderConfig, PolicySource};
use crate::plugin::{AfterDecisionOutcome, BeforeCheckOutcome, Plugin};
use crate::schema::{
    ActionRequest, AgentActionRequest, AgentIdentity, Decision, Event, EventOutcome, Outcome,
    Reason, RequestContext, TrustLevel,
};
use crate::value::Value;

/// A host-supplied asynchronous policy source, polled once per `init()` /
/// `reload_policy_async()` call.
#[async_trait]
pub trait AsyncPolicySource: Send + Sync {
    async fn load(&self) -> Result<crate::schema::PolicyBundle, LoaderError>;
}

/// Where the engine gets its initial bundle from.
pub enum InitialPolicySource {
    Sync(PolicySource),
    Async(Arc<dyn AsyncPolicySource>),
}

/// Host callbacks. Every method has a no-op/`None` default so a host only
/// implements the ones it cares about. The four resolution callbacks return
/// `Option` so the engine can distinguish "not configured" (falls through
/// to deny, per §4.3) from "configured and returned an answer".
#[async_trait]
pub trait EngineCallbacks: Send + Sync {
    async fn on_approval_required(
        &self,
        _request: &AgentActionRequest,
        _decision: &Decision,
    ) -> Option<Result<bool, String>> {
        None
    }

    async fn on_step_up_required(
        &self,
        _request: &AgentActionRequest,
        _decision: &Decision,
    ) -> Option<Result<bool, String>> {
        None
    }

    async fn on_ticket_required(
        &self,
        _request: &AgentActionRequest,
        _decision: &Decision,
    ) -> Option<Result<Option<String>, String>> {
        None
    }

    async fn on_human_required(
        &self,
        _request: &AgentActionRequest,
        _decision: &Decision,
    ) -> Option<Result<bool, String>> {
        None
    }

    async fn on_allow(&self, _request: &AgentActionRequest, _decision: &Decision) -> Result<(), String> {
        Ok(())
    }

    async fn on_deny(&self, _request: &AgentActionRequest, _decision: &Decision) -> Result<(), String> {
        Ok(())
    }

    async fn on_audit_event(&self, _event: &Event) -> Result<(), String> {
        Ok(())
    }

    async fn on_error(&self, _error: &str, _context: &str) {}
}

/// Default callback set: every resolution callback is "not configured",
/// every fire-and-log hook is a no-op. Analogous to the teacher's
/// `NullDecisionEmitter`.
pub struct NullCallbacks;

impl EngineCallbacks for NullCallbacks {}

/// Engine configuration (§4.3). Fields not named explicitly by the spec
/// text (audit size, timeout) are given the documented defaults.
pub struct EngineConfig {
    pub policy_source: InitialPolicySource,
    pub loader_config: LoaderConfig,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub callbacks: Arc<dyn EngineCallbacks>,
    pub default_environment: Option<String>,
    pub default_owner: Option<String>,
    pub approval_timeout_ms: u64,
    pub max_audit_log_size: usize,
}

impl EngineConfig {
    pub fn new(policy_source: InitialPolicySource) -> Self {
        Self {
            policy_source,
            loader_config: LoaderConfig::default(),
            plugins: Vec::new(),
            callbacks: Arc::new(NullCallbacks),
            default_environment: None,
            default_owner: None,
            approval_timeout_ms: 0,
            max_audit_log_size: 10_000,
        }
    }
}

/// Parameters for one `check()` call. `environment` falls back to
/// `EngineConfig::default_environment` when absent; everything else is
/// request-specific.
#[derive(Default, Clone)]
pub struct CheckParams {
    pub agent_id: String,
    pub tool_name: String,
    pub tool_args: std::collections::BTreeMap<String, Value>,
    pub environment: Option<String>,
    pub name: Option<String>,
    pub owner: Option<String>,
    pub agent_type: Option<String>,
    pub trust_level: Option<TrustLevel>,
    pub roles: Vec<String>,
    pub capabilities: Vec<String>,
    pub max_delegation_depth: Option<u32>,
    pub tool_identity: Option<String>,
    pub tool_provider: Option<String>,
    pub user_input: Option<String>,
    pub data_labels: Vec<String>,
    pub session_id: Option<String>,
    pub parent_agent_id: Option<String>,
    pub delegation_chain: Vec<String>,
}

pub struct CheckResult {
    pub allowed: bool,
    pub decision: Decision,
    pub event: Event,
}

struct EngineState {
    evaluator: Option<Evaluator>,
    audit_log: VecDeque<Event>,
    audit_ids: HashSet<Uuid>,
}

/// The engine. Cheaply cloneable via `Arc<Engine>` for hosts that need to
/// share one instance across tasks; internally, all shared mutable state
/// lives behind a single `tokio::sync::Mutex`, held across every await
/// point inside `check()` so that plugin-visible ordering matches §5.
pub struct Engine {
    state: tokio::sync::Mutex<EngineState>,
    plugins: Vec<Arc<dyn Plugin>>,
    callbacks: Arc<dyn EngineCallbacks>,
    default_environment: Option<String>,
    default_owner: Option<String>,
    approval_timeout_ms: u64,
    max_audit_log_size: usize,
    loader_config: LoaderConfig,
}

enum Resolved<T> {
    NotConfigured,
    Value(T),
    CallbackError(String),
    TimedOut,
}

impl Engine {
    /// Constructs the engine. For a synchronous policy source, the engine
    /// is immediately usable (no separate `init()` call required). For an
    /// async source, the evaluator is left unset until `init()` runs;
    /// `check()` before that fails with `NOT_INITIALIZED`.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let evaluator = match &config.policy_source {
            InitialPolicySource::Sync(source) => {
                let bundle = loader::load_bundle(source, &config.loader_config)?;
                let (evaluator, diagnostics) = Evaluator::new(bundle);
                for diag in diagnostics {
                    tracing::warn!(rule_id = %diag.rule_id, pattern = %diag.pattern, reason = %diag.reason, "rejected unsafe regex at bundle registration");
                }
                Some(evaluator)
            }
            InitialPolicySource::Async(_) => None,
        };

        let loaded_synchronously = evaluator.is_some();

        let engine = Self {
            state: tokio::sync::Mutex::new(EngineState {
                evaluator,
                audit_log: VecDeque::new(),
                audit_ids: HashSet::new(),
            }),
            plugins: config.plugins,
            callbacks: config.callbacks,
            default_environment: config.default_environment,
            default_owner: config.default_owner,
            approval_timeout_ms: config.approval_timeout_ms,
            max_audit_log_size: config.max_audit_log_size,
            loader_config: config.loader_config,
        };

        if loaded_synchronously {
            // Synchronous source: plugins initialize eagerly so the engine
            // really is immediately usable end-to-end.
            for plugin in &engine.plugins {
                plugin
                    .initialize()
                    .await
                    .map_err(|e| EngineError::InvalidArguments(format!("plugin {} failed to initialize: {}", plugin.name(), e)))?;
            }
        }

        Ok(engine)
    }

    /// Loads and validates the bundle from a host-supplied async source,
    /// then runs every plugin's `initialize()` in declaration order. A
    /// no-op if the engine was already initialized via a synchronous
    /// source.
    pub async fn init(&self, source: &dyn AsyncPolicySource) -> Result<(), EngineError> {
        {
            let state = self.state.lock().await;
            if state.evaluator.is_some() {
                return Ok(());
            }
        }

        let bundle = source.load().await?;
        let (evaluator, diagnostics) = Evaluator::new(bundle);
        for diag in diagnostics {
            tracing::warn!(rule_id = %diag.rule_id, pattern = %diag.pattern, reason = %diag.reason, "rejected unsafe regex at bundle registration");
        }

        {
            let mut state = self.state.lock().await;
            state.evaluator = Some(evaluator);
        }

        for plugin in &self.plugins {
            plugin.initialize().await.map_err(|e| {
                EngineError::InvalidArguments(format!(
                    "plugin {} failed to initialize: {}",
                    plugin.name(),
                    e
                ))
            })?;
        }

        Ok(())
    }

    /// Evaluates one proposed tool invocation through the full five-phase
    /// pipeline (phases 1-4; phase 5 only runs through `protect`).
    pub async fn check(&self, params: CheckParams) -> Result<CheckResult, EngineError> {
        if params.agent_id.trim().is_empty() {
            return Err(EngineError::InvalidArguments("agent_id must not be empty".to_string()));
        }
        if params.tool_name.trim().is_empty() {
            return Err(EngineError::InvalidArguments("tool_name must not be empty".to_string()));
        }

        let environment = params
            .environment
            .clone()
            .or_else(|| self.default_environment.clone())
            .ok_or_else(|| EngineError::InvalidArguments("environment is required".to_string()))?;

        let mut request = AgentActionRequest {
            request_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            agent: AgentIdentity {
                agent_id: params.agent_id,
                name: params.name,
                owner: params.owner.or_else(|| self.default_owner.clone()),
                environment,
                agent_type: params.agent_type,
                trust_level: params.trust_level,
                roles: params.roles,
                capabilities: params.capabilities,
                max_delegation_depth: params.max_delegation_depth,
                attestation: None,
            },
            action: ActionRequest {
                action_type: None,
                tool_name: params.tool_name,
                tool_args: params.tool_args,
                tool_identity: params.tool_identity,
                tool_provider: params.tool_provider,
            },
            context: RequestContext {
                user_input: params.user_input,
                data_labels: params.data_labels,
                session_id: params.session_id,
                parent_agent_id: params.parent_agent_id,
                delegation_chain: params.delegation_chain,
                extra: Default::default(),
            },
        };
        request
            .validate_non_empty()
            .map_err(EngineError::InvalidArguments)?;

        let mut state = self.state.lock().await;
        if state.evaluator.is_none() {
            return Err(EngineError::NotInitialized);
        }

        // Phase 1 — beforeCheck.
        for plugin in &self.plugins {
            match plugin.before_check(&request).await {
                Ok(BeforeCheckOutcome::Continue) => {}
                Ok(BeforeCheckOutcome::ModifiedRequest(modified)) => {
                    request = modified;
                }
                Ok(BeforeCheckOutcome::Decide(decision)) => {
                    let event = build_event(&request, &decision, Some(plugin.name().to_string()));
                    self.record_event(&mut state, event.clone()).await;
                    return Ok(CheckResult {
                        allowed: decision.outcome == Outcome::Allow,
                        decision,
                        event,
                    });
                }
                Err(err) => {
                    self.callbacks
                        .on_error(&err.0, &format!("plugin:{}:beforeCheck", plugin.name()))
                        .await;
                    if plugin.fail_open() {
                        continue;
                    }
                    let decision = Decision::deny(Reason::new("PLUGIN_ERROR", err.0.clone()));
                    let event = build_event(&request, &decision, Some(plugin.name().to_string()));
                    self.record_event(&mut state, event.clone()).await;
                    return Ok(CheckResult {
                        allowed: false,
                        decision,
                        event,
                    });
                }
            }
        }

        // Phase 2 — evaluate.
        let mut decision = state
            .evaluator
            .as_mut()
            .expect("checked above")
            .evaluate(&request);

        // Phase 3 — afterDecision.
        for plugin in &self.plugins {
            match plugin.after_decision(&request, &decision).await {
                Ok(AfterDecisionOutcome::Continue) => {}
                Ok(AfterDecisionOutcome::Override(overridden)) => {
                    decision = overridden;
                }
                Err(err) => {
                    self.callbacks
                        .on_error(&err.0, &format!("plugin:{}:afterDecision", plugin.name()))
                        .await;
                    if plugin.fail_open() {
                        continue;
                    }
                    decision = Decision::deny(Reason::new("PLUGIN_ERROR", err.0.clone()));
                    let event = build_event(&request, &decision, Some(plugin.name().to_string()));
                    self.record_event(&mut state, event.clone()).await;
                    return Ok(CheckResult {
                        allowed: false,
                        decision,
                        event,
                    });
                }
            }
        }

        let primary_event = build_event(&request, &decision, None);
        self.record_event(&mut state, primary_event.clone()).await;

        // Phase 4 — resolution.
        let allowed = match decision.outcome {
            Outcome::Allow => {
                if let Err(e) = self.callbacks.on_allow(&request, &decision).await {
                    self.callbacks.on_error(&e, "callback:on_allow").await;
                }
                true
            }
            Outcome::Deny => {
                if let Err(e) = self.callbacks.on_deny(&request, &decision).await {
                    self.callbacks.on_error(&e, "callback:on_deny").await;
                }
                false
            }
            Outcome::RequireApproval => {
                self.resolve_bool(
                    &mut state,
                    &request,
                    &decision,
                    self.callbacks.on_approval_required(&request, &decision),
                    "APPROVED",
                    "REJECTED",
                    "APPROVAL_TIMEOUT",
                    "callback:on_approval_required",
                )
                .await
            }
            Outcome::StepUp => {
                self.resolve_bool(
                    &mut state,
                    &request,
                    &decision,
                    self.callbacks.on_step_up_required(&request, &decision),
                    "STEP_UP_PASSED",
                    "STEP_UP_FAILED",
                    "STEP_UP_ERROR",
                    "callback:on_step_up_required",
                )
                .await
            }
            Outcome::RequireHuman => {
                self.resolve_bool(
                    &mut state,
                    &request,
                    &decision,
                    self.callbacks.on_human_required(&request, &decision),
                    "HUMAN_APPROVED",
                    "HUMAN_REJECTED",
                    "HUMAN_REVIEW_ERROR",
                    "callback:on_human_required",
                )
                .await
            }
            Outcome::RequireTicket => {
                let resolved = self
                    .resolve(self.callbacks.on_ticket_required(&request, &decision))
                    .await;
                match resolved {
                    Resolved::Value(Some(_ticket_id)) => {
                        let event = build_event_with_outcome(
                            &request,
                            EventOutcome::Approved,
                            vec![Reason::new("TICKET_VALIDATED", "ticket accepted")],
                            None,
                        );
                        self.record_event(&mut state, event).await;
                        true
                    }
                    Resolved::Value(None) | Resolved::NotConfigured => {
                        let event = build_event_with_outcome(
                            &request,
                            EventOutcome::Rejected,
                            vec![Reason::new("TICKET_MISSING", "no ticket supplied")],
                            None,
                        );
                        self.record_event(&mut state, event).await;
                        false
                    }
                    Resolved::CallbackError(e) => {
                        self.callbacks.on_error(&e, "callback:on_ticket_required").await;
                        let event = build_event_with_outcome(
                            &request,
                            EventOutcome::Deny,
                            vec![Reason::new("TICKET_ERROR", e)],
                            None,
                        );
                        self.record_event(&mut state, event).await;
                        false
                    }
                    Resolved::TimedOut => {
                        self.callbacks
                            .on_error("ticket callback timed out", "callback:on_ticket_required")
                            .await;
                        let event = build_event_with_outcome(
                            &request,
                            EventOutcome::Timeout,
                            vec![Reason::new("TICKET_ERROR", "timed out waiting for ticket")],
                            None,
                        );
                        self.record_event(&mut state, event).await;
                        false
                    }
                }
            }
        };

        Ok(CheckResult {
            allowed,
            decision,
            event: primary_event,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_bool(
        &self,
        state: &mut tokio::sync::MutexGuard<'_, EngineState>,
        request: &AgentActionRequest,
        _decision: &Decision,
        fut: impl std::future::Future<Output = Option<Result<bool, String>>>,
        success_code: &'static str,
        failure_code: &'static str,
        error_code: &'static str,
        error_context: &'static str,
    ) -> bool {
        match self.resolve(fut).await {
            Resolved::Value(true) => {
                let event = build_event_with_outcome(
                    request,
                    EventOutcome::Approved,
                    vec![Reason::new(success_code, "resolution callback approved the request")],
                    None,
                );
                self.record_event(state, event).await;
                true
            }
            Resolved::Value(false) | Resolved::NotConfigured => {
                let event = build_event_with_outcome(
                    request,
                    EventOutcome::Rejected,
                    vec![Reason::new(failure_code, "resolution callback did not approve the request")],
                    None,
                );
                self.record_event(state, event).await;
                false
            }
            Resolved::CallbackError(e) => {
                self.callbacks.on_error(&e, error_context).await;
                let event = build_event_with_outcome(request, EventOutcome::Deny, vec![Reason::new(error_code, e)], None);
                self.record_event(state, event).await;
                false
            }
            Resolved::TimedOut => {
                self.callbacks.on_error("resolution callback timed out", error_context).await;
                let event = build_event_with_outcome(
                    request,
                    EventOutcome::Timeout,
                    vec![Reason::new(error_code, "timed out waiting for resolution callback")],
                    None,
                );
                self.record_event(state, event).await;
                false
            }
        }
    }

    /// Races `fut` against the approval timeout (if configured). Dropping
    /// either the timeout future or `fut` itself on any exit path cancels
    /// any pending timer — there is no separate "stop the timer" step to
    /// forget.
    async fn resolve<T>(&self, fut: impl std::future::Future<Output = Option<Result<T, String>>>) -> Resolved<T> {
        let outcome = if self.approval_timeout_ms == 0 {
            fut.await
        } else {
            match tokio::time::timeout(Duration::from_millis(self.approval_timeout_ms), fut).await {
                Ok(v) => v,
                Err(_) => return Resolved::TimedOut,
            }
        };
        match outcome {
            None => Resolved::NotConfigured,
            Some(Ok(v)) => Resolved::Value(v),
            Some(Err(e)) => Resolved::CallbackError(e),
        }
    }

    async fn record_event(&self, state: &mut tokio::sync::MutexGuard<'_, EngineState>, event: Event) {
        if state.audit_ids.contains(&event.event_id) {
            tracing::debug!(event_id = %event.event_id, "dropping duplicate audit event id");
            return;
        }
        state.audit_ids.insert(event.event_id);
        state.audit_log.push_back(event.clone());

        if self.max_audit_log_size > 0 {
            while state.audit_log.len() > self.max_audit_log_size {
                if let Some(evicted) = state.audit_log.pop_front() {
                    state.audit_ids.remove(&evicted.event_id);
                }
            }
        }

        if let Err(e) = self.callbacks.on_audit_event(&event).await {
            self.callbacks.on_error(&e, "callback:on_audit_event").await;
        }
    }

    /// A shallow copy of the current audit log, oldest first.
    pub async fn audit_log(&self) -> Vec<Event> {
        self.state.lock().await.audit_log.iter().cloned().collect()
    }

    /// Builds a new bundle from a synchronous source and atomically swaps
    /// it in. Plugin state is untouched.
    pub async fn reload_policy(&self, source: &PolicySource) -> Result<(), EngineError> {
        let bundle = loader::load_bundle(source, &self.loader_config)?;
        let mut state = self.state.lock().await;
        let diagnostics = match state.evaluator.as_mut() {
            Some(evaluator) => evaluator.update_bundle(bundle),
            None => {
                let (evaluator, diagnostics) = Evaluator::new(bundle);
                state.evaluator = Some(evaluator);
                diagnostics
            }
        };
        for diag in diagnostics {
            tracing::warn!(rule_id = %diag.rule_id, pattern = %diag.pattern, reason = %diag.reason, "rejected unsafe regex on reload");
        }
        Ok(())
    }

    /// Builds a new bundle from a host-supplied async loader and atomically
    /// swaps it in.
    pub async fn reload_policy_async(&self, source: &dyn AsyncPolicySource) -> Result<(), EngineError> {
        let bundle = source.load().await?;
        let mut state = self.state.lock().await;
        let diagnostics = match state.evaluator.as_mut() {
            Some(evaluator) => evaluator.update_bundle(bundle),
            None => {
                let (evaluator, diagnostics) = Evaluator::new(bundle);
                state.evaluator = Some(evaluator);
                diagnostics
            }
        };
        for diag in diagnostics {
            tracing::warn!(rule_id = %diag.rule_id, pattern = %diag.pattern, reason = %diag.reason, "rejected unsafe regex on reload");
        }
        Ok(())
    }

    /// Runs every plugin's optional `destroy()` in declaration order.
    pub async fn shutdown(&self) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.destroy().await {
                self.callbacks.on_error(&e.0, &format!("plugin:{}:destroy", plugin.name())).await;
            }
        }
    }

    /// Checks `tool_name`, and if allowed, invokes `f`. In both outcomes,
    /// every plugin's optional `afterExecution` hook runs (Phase 5). On
    /// denial, returns a `SecurityBlockedError` carrying the decision
    /// instead of invoking `f`.
    pub async fn protect<T, E, F, Fut>(
        &self,
        params: CheckParams,
        f: F,
    ) -> Result<T, ProtectError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let request = self.build_request_for_protect(&params);
        let result = self.check(params).await.map_err(ProtectError::Engine)?;

        if !result.allowed {
            self.run_after_execution(&request, &result.decision, None, None).await;
            return Err(ProtectError::Blocked(SecurityBlockedError { decision: result.decision }));
        }

        match f().await {
            Ok(value) => {
                self.run_after_execution(&request, &result.decision, Some("ok"), None).await;
                Ok(value)
            }
            Err(err) => {
                let message = err.to_string();
                self.run_after_execution(&request, &result.decision, None, Some(&message)).await;
                Err(ProtectError::Inner(err))
            }
        }
    }

    fn build_request_for_protect(&self, params: &CheckParams) -> AgentActionRequest {
        AgentActionRequest {
            request_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            agent: AgentIdentity {
                agent_id: params.agent_id.clone(),
                name: params.name.clone(),
                owner: params.owner.clone().or_else(|| self.default_owner.clone()),
                environment: params
                    .environment
                    .clone()
                    .or_else(|| self.default_environment.clone())
                    .unwrap_or_default(),
                agent_type: params.agent_type.clone(),
                trust_level: params.trust_level,
                roles: params.roles.clone(),
                capabilities: params.capabilities.clone(),
                max_delegation_depth: params.max_delegation_depth,
                attestation: None,
            },
            action: ActionRequest {
                action_type: None,
                tool_name: params.tool_name.clone(),
                tool_args: params.tool_args.clone(),
                tool_identity: params.tool_identity.clone(),
                tool_provider: params.tool_provider.clone(),
            },
            context: RequestContext {
                user_input: params.user_input.clone(),
                data_labels: params.data_labels.clone(),
                session_id: params.session_id.clone(),
                parent_agent_id: params.parent_agent_id.clone(),
                delegation_chain: params.delegation_chain.clone(),
                extra: Default::default(),
            },
        }
    }

    async fn run_after_execution(
        &self,
        request: &AgentActionRequest,
        decision: &Decision,
        result: Option<&str>,
        error: Option<&str>,
    ) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.after_execution(request, decision, result, error).await {
                self.callbacks
                    .on_error(&e.0, &format!("plugin:{}:afterExecution", plugin.name()))
                    .await;
            }
        }
    }
}

/// Error surfaced by `protect()`: either an engine-level programmer error,
/// a security denial (carrying the decision), or the wrapped call's own
/// error.
#[derive(Debug, thiserror::Error)]
pub enum ProtectError<E> {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Blocked(#[from] SecurityBlockedError),
    #[error("{0}")]
    Inner(E),
}
