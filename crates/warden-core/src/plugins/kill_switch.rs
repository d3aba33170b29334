//! Reference plugin: agent-level and global kill switch.
//!
//! Grounded on the teacher's `kill_switch` module *naming and report shape*
//! (`kill_switch::{KillReport, incident}`), but rebuilt at the agent level:
//! the teacher's kill-switch signals a PID (process control is out of scope
//! per spec.md's Non-goals), whereas this one consults an in-memory
//! `killed_agents` map and a `global_kill` flag from `beforeCheck`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::plugin::{BeforeCheckOutcome, Plugin, PluginError};
use crate::schema::{AgentActionRequest, Decision, Reason};

/// A snapshot of the kill switch's state, returned by [`KillSwitch::get_state`].
#[derive(Debug, Clone, Default)]
pub struct KillSwitchState {
    pub killed_agents: HashMap<String, String>,
    pub global_kill: bool,
    pub global_reason: String,
}

/// Optional persistence hooks. A host that wants kill-switch state to
/// survive a process restart implements this and passes it to
/// [`KillSwitch::with_persistence`]; the plugin calls `load_state` once at
/// `initialize()` and `on_state_change` after every mutation.
pub trait KillSwitchPersistence: Send + Sync {
    fn load_state(&self) -> Option<KillSwitchState>;
    fn on_state_change(&self, state: &KillSwitchState);
}

struct Inner {
    state: KillSwitchState,
    persistence: Option<Box<dyn KillSwitchPersistence>>,
}

/// An agent-level and global kill switch plugin.
///
/// `beforeCheck` denies with `GLOBAL_KILL_SWITCH` when [`kill_all`] has been
/// called, or with `AGENT_KILL_SWITCH` when the requesting agent is in the
/// killed set. Administrative state changes (`kill`, `revive`, `kill_all`,
/// `revive_all`) are synchronous and immediately visible to the next
/// `check()` call, because the engine serializes pipeline entries under its
/// own mutex.
///
/// [`kill_all`]: KillSwitch::kill_all
pub struct KillSwitch {
    inner: Mutex<Inner>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: KillSwitchState::default(),
                persistence: None,
            }),
        }
    }

    pub fn with_persistence(persistence: Box<dyn KillSwitchPersistence>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: KillSwitchState::default(),
                persistence: Some(persistence),
            }),
        }
    }

    fn save(&self, inner: &Inner) {
        if let Some(persistence) = &inner.persistence {
            persistence.on_state_change(&inner.state);
        }
    }

    pub fn kill(&self, agent_id: &str, reason: impl Into<String>) {
        let mut inner = self.inner.lock().expect("kill switch mutex poisoned");
        inner.state.killed_agents.insert(agent_id.to_string(), reason.into());
        self.save(&inner);
    }

    pub fn revive(&self, agent_id: &str) {
        let mut inner = self.inner.lock().expect("kill switch mutex poisoned");
        inner.state.killed_agents.remove(agent_id);
        self.save(&inner);
    }

    pub fn kill_all(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().expect("kill switch mutex poisoned");
        inner.state.global_kill = true;
        inner.state.global_reason = reason.into();
        self.save(&inner);
    }

    pub fn revive_all(&self) {
        let mut inner = self.inner.lock().expect("kill switch mutex poisoned");
        inner.state.global_kill = false;
        inner.state.global_reason.clear();
        self.save(&inner);
    }

    pub fn is_killed(&self, agent_id: &str) -> bool {
        let inner = self.inner.lock().expect("kill switch mutex poisoned");
        inner.state.global_kill || inner.state.killed_agents.contains_key(agent_id)
    }

    pub fn get_state(&self) -> KillSwitchState {
        self.inner.lock().expect("kill switch mutex poisoned").state.clone()
    }
}

#[async_trait]
impl Plugin for KillSwitch {
    fn name(&self) -> &str {
        "kill-switch"
    }

    async fn initialize(&self) -> Result<(), PluginError> {
        let mut inner = self.inner.lock().expect("kill switch mutex poisoned");
        if let Some(persistence) = &inner.persistence {
            if let Some(loaded) = persistence.load_state() {
                inner.state = loaded;
            }
        }
        Ok(())
    }

    async fn before_check(&self, request: &AgentActionRequest) -> Result<BeforeCheckOutcome, PluginError> {
        let inner = self.inner.lock().expect("kill switch mutex poisoned");
        if inner.state.global_kill {
            return Ok(BeforeCheckOutcome::Decide(Decision::deny(Reason::new(
                "GLOBAL_KILL_SWITCH",
                inner.state.global_reason.clone(),
            ))));
        }
        if let Some(reason) = inner.state.killed_agents.get(&request.agent.agent_id) {
            return Ok(BeforeCheckOutcome::Decide(Decision::deny(Reason::new(
                "AGENT_KILL_SWITCH",
                reason.clone(),
            ))));
        }
        Ok(BeforeCheckOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ActionRequest, AgentIdentity, RequestContext};
    use std::collections::BTreeMap;

    fn request(agent_id: &str) -> AgentActionRequest {
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
                tool_name: "any_tool".to_string(),
                tool_args: BTreeMap::new(),
                tool_identity: None,
                tool_provider: None,
            },
            context: RequestContext::default(),
        }
    }

    #[tokio::test]
    async fn not_killed_continues() {
        let plugin = KillSwitch::new();
        let outcome = plugin.before_check(&request("agent-1")).await.unwrap();
        assert!(matches!(outcome, BeforeCheckOutcome::Continue));
    }

    #[tokio::test]
    async fn killed_agent_denies_with_agent_code() {
        let plugin = KillSwitch::new();
        plugin.kill("agent-1", "compromised credentials");
        let outcome = plugin.before_check(&request("agent-1")).await.unwrap();
        match outcome {
            BeforeCheckOutcome::Decide(decision) => {
                assert_eq!(decision.reasons[0].code, "AGENT_KILL_SWITCH");
            }
            _ => panic!("expected a decision"),
        }
        // a different agent is unaffected
        let outcome = plugin.before_check(&request("agent-2")).await.unwrap();
        assert!(matches!(outcome, BeforeCheckOutcome::Continue));
    }

    #[tokio::test]
    async fn global_kill_blocks_every_agent() {
        let plugin = KillSwitch::new();
        plugin.kill_all("incident-42");
        for agent in ["agent-1", "agent-2"] {
            let outcome = plugin.before_check(&request(agent)).await.unwrap();
            match outcome {
                BeforeCheckOutcome::Decide(decision) => {
                    assert_eq!(decision.reasons[0].code, "GLOBAL_KILL_SWITCH");
                }
                _ => panic!("expected a decision"),
            }
        }
        plugin.revive_all();
        let outcome = plugin.before_check(&request("agent-1")).await.unwrap();
        assert!(matches!(outcome, BeforeCheckOutcome::Continue));
    }

    #[tokio::test]
    async fn revive_clears_a_single_agent() {
        let plugin = KillSwitch::new();
        plugin.kill("agent-1", "x");
        plugin.revive("agent-1");
        assert!(!plugin.is_killed("agent-1"));
    }

    struct RecordingPersistence {
        saved: std::sync::Arc<Mutex<Vec<KillSwitchState>>>,
    }

    impl KillSwitchPersistence for RecordingPersistence {
        fn load_state(&self) -> Option<KillSwitchState> {
            None
        }
        fn on_state_change(&self, state: &KillSwitchState) {
            self.saved.lock().unwrap().push(state.clone());
        }
    }

    #[test]
    fn mutations_call_persistence_hook() {
        let saved = std::sync::Arc::new(Mutex::new(Vec::new()));
        let persistence = Box::new(RecordingPersistence { saved: saved.clone() });
        let plugin = KillSwitch::with_persistence(persistence);
        plugin.kill("agent-1", "x");
        plugin.kill_all("y");
        assert_eq!(saved.lock().unwrap().len(), 2);
        assert!(saved.lock().unwrap().last().unwrap().global_kill);
    }
}
