//! Reference plugin: scans tool output for safety violations after the
//! fact. `after_execution`-only — the tool has already run by the time this
//! hook fires, so it records violations rather than blocking anything.

use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;

use crate::plugin::{Plugin, PluginError};
use crate::schema::{AgentActionRequest, Decision};

/// One recorded violation: which rule fired, against which request, and a
/// snippet of the offending output (not the full payload, to keep this
/// cheap to retain).
#[derive(Debug, Clone)]
pub struct OutputViolation {
    pub request_id: uuid::Uuid,
    pub tool_name: String,
    pub rule: String,
    pub snippet: String,
}

/// A single scan rule: either a compiled regex or a plain keyword, each with
/// a name used in [`OutputViolation::rule`].
enum Rule {
    Regex { name: String, pattern: Regex },
    Keyword { name: String, keyword: String },
}

/// Configuration for [`OutputValidator`]: the regexes and forbidden keywords
/// to scan serialized tool output against.
pub struct OutputValidatorConfig {
    rules: Vec<Rule>,
}

impl OutputValidatorConfig {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_regex(mut self, name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        self.rules.push(Rule::Regex {
            name: name.into(),
            pattern: Regex::new(pattern)?,
        });
        Ok(self)
    }

    pub fn with_keyword(mut self, name: impl Into<String>, keyword: impl Into<String>) -> Self {
        self.rules.push(Rule::Keyword {
            name: name.into(),
            keyword: keyword.into(),
        });
        self
    }
}

impl Default for OutputValidatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans serialized tool output for configured safety regexes and forbidden
/// keywords, recording (never blocking) any violation.
pub struct OutputValidator {
    config: OutputValidatorConfig,
    violations: Mutex<Vec<OutputViolation>>,
}

impl OutputValidator {
    pub fn new(config: OutputValidatorConfig) -> Self {
        Self {
            config,
            violations: Mutex::new(Vec::new()),
        }
    }

    pub fn violations(&self) -> Vec<OutputViolation> {
        self.violations.lock().expect("output validator mutex poisoned").clone()
    }

    fn snippet(text: &str) -> String {
        const MAX: usize = 160;
        if text.len() <= MAX {
            return text.to_string();
        }
        let mut cut = MAX;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    }
}

#[async_trait]
impl Plugin for OutputValidator {
    fn name(&self) -> &str {
        "output-validator"
    }

    async fn after_execution(
        &self,
        request: &AgentActionRequest,
        _decision: &Decision,
        result: Option<&str>,
        _error: Option<&str>,
    ) -> Result<(), PluginError> {
        let Some(output) = result else {
            return Ok(());
        };

        let mut hits = Vec::new();
        for rule in &self.config.rules {
            match rule {
                Rule::Regex { name, pattern } => {
                    if pattern.is_match(output) {
                        hits.push(OutputViolation {
                            request_id: request.request_id,
                            tool_name: request.action.tool_name.clone(),
                            rule: name.clone(),
                            snippet: Self::snippet(output),
                        });
                    }
                }
                Rule::Keyword { name, keyword } => {
                    if output.to_lowercase().contains(&keyword.to_lowercase()) {
                        hits.push(OutputViolation {
                            request_id: request.request_id,
                            tool_name: request.action.tool_name.clone(),
                            rule: name.clone(),
                            snippet: Self::snippet(output),
                        });
                    }
                }
            }
        }

        if !hits.is_empty() {
            let mut violations = self.violations.lock().expect("output validator mutex poisoned");
            violations.extend(hits);
        }
        Ok(())
    }
}
