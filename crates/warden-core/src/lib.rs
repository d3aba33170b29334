//! Runtime security decision engine for AI-agent tool calls.
//!
//! For every proposed tool invocation, [`engine::Engine::check`] combines a
//! signed, declarative [`schema::PolicyBundle`] with an ordered pipeline of
//! stateful [`plugin::Plugin`]s to produce a [`schema::Decision`] and a
//! tamper-evident [`schema::Event`]. The engine is embedded in-process by
//! hosts; it is not a network service, and it persists nothing across
//! process restarts on its own (plugins may opt in via their own
//! persistence hooks).
//!
//! Module map (mirrors the component table in the design document):
//!
//! - [`schema`] — typed request/decision/event/rule records (C1).
//! - [`value`] — the recursive tagged value used for `tool_args` (C1).
//! - [`loader`] — parse, validate, size-guard, and HMAC-verify a bundle (C2).
//! - [`regex_cache`] — ReDoS-safe regex cache owned by the evaluator (C3).
//! - [`evaluator`] — first-match rule engine (C3).
//! - [`plugin`] — the plugin capability interface (C4).
//! - [`plugins`] — reference plugin implementations (kill-switch, rate
//!   limiter, session budget, output validator).
//! - [`engine`] — pipeline orchestration, mutex, audit ring, resolver (C5).
//! - [`event`] — request + decision → audit event (C7).
//! - [`errors`] — the error taxonomy shared across the crate.

pub mod engine;
pub mod errors;
pub mod event;
pub mod evaluator;
pub mod loader;
pub mod plugin;
pub mod plugins;
pub mod regex_cache;
pub mod schema;
pub mod value;

pub use engine::{
    AsyncPolicySource, CheckParams, CheckResult, Engine, EngineCallbacks, EngineConfig,
    InitialPolicySource, NullCallbacks, ProtectError,
};
pub use errors::{EngineError, LoaderError, SecurityBlockedError};
pub use loader::{LoaderConfig, PolicySource};
pub use plugin::{AfterDecisionOutcome, BeforeCheckOutcome, Plugin, PluginError};
pub use schema::{
    ActionRequest, AgentActionRequest, AgentIdentity, Decision, Event, EventOutcome, Outcome,
    PolicyBundle, PolicyRule, Reason, RequestContext, TrustLevel,
};
pub use value::Value;
