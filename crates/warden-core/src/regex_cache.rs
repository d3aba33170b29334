//! ReDoS-safe regex cache, owned by a single `Evaluator` instance.
//!
//! The spec's design notes call out a global/`lazy_static` regex cache as a
//! correctness hazard across bundles: this cache is instance-scoped and is
//! cleared wholesale on `update_bundle`, never shared across bundles or
//! evaluators.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use regex::Regex;

pub const MAX_PATTERN_LEN: usize = 512;
const PROBE_STRING_LEN: usize = 100;
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// A diagnostic emitted when a rule's `matches_regex` pattern is rejected at
/// bundle registration, so operators see dead conditions early rather than
/// discovering a silently-never-matching rule in production.
#[derive(Debug, Clone)]
pub struct RegexDiagnostic {
    pub rule_id: String,
    pub pattern: String,
    pub reason: String,
}

/// Instance-owned cache of `pattern -> compiled-or-rejected`. A rejected
/// pattern is cached as `None` so repeated lookups don't re-run the shape
/// checks and probe.
#[derive(Default)]
pub struct RegexCache {
    entries: HashMap<String, Option<Regex>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every cached entry. Called by `Evaluator::update_bundle`.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the compiled regex for `pattern`, compiling (and safety-
    /// checking) it on first use. A pattern that fails any safety check is
    /// cached as rejected and always treated as a non-match by callers
    /// (fail-closed for the `matches_regex` condition, per §4.2).
    pub fn get(&mut self, pattern: &str) -> Option<&Regex> {
        if !self.entries.contains_key(pattern) {
            let compiled = compile_safe(pattern);
            self.entries.insert(pattern.to_string(), compiled);
        }
        self.entries.get(pattern).and_then(|opt| opt.as_ref())
    }

    /// Pre-compiles `pattern`, returning a diagnostic if it was rejected.
    /// Used at bundle registration to surface dead conditions immediately.
    pub fn precompile(&mut self, rule_id: &str, pattern: &str) -> Option<RegexDiagnostic> {
        if self.get(pattern).is_some() {
            return None;
        }
        Some(RegexDiagnostic {
            rule_id: rule_id.to_string(),
            pattern: pattern.to_string(),
            reason: rejection_reason(pattern),
        })
    }
}

/// Shape rules that reject nested-quantifier and related ReDoS precursors
/// before a pattern is ever handed to the regex engine.
fn dangerous_shapes() -> &'static [&'static str] {
    &[
        r"(.*[+*].*)[+*]",
        r"(.*\|.*)[+*]",
        r"(.*[+*].*)\{",
        r"([^)]*\*[^)]*)\*",
        r"([^)]*\+[^)]*)\+",
        r"(.*){2,}",
    ]
}

fn matches_dangerous_shape(pattern: &str) -> bool {
    for shape in dangerous_shapes() {
        if let Ok(shape_re) = Regex::new(shape) {
            if shape_re.is_match(pattern) {
                return true;
            }
        }
    }
    false
}

fn rejection_reason(pattern: &str) -> String {
    if pattern.len() > MAX_PATTERN_LEN {
        return format!("pattern exceeds {MAX_PATTERN_LEN} characters");
    }
    if matches_dangerous_shape(pattern) {
        return "pattern matches a known ReDoS-precursor shape".to_string();
    }
    match Regex::new(&format!("(?i){pattern}")) {
        Err(e) => format!("failed to compile: {e}"),
        Ok(_) => "failed probe timing check".to_string(),
    }
}

fn compile_safe(pattern: &str) -> Option<Regex> {
    if pattern.len() > MAX_PATTERN_LEN {
        return None;
    }
    if matches_dangerous_shape(pattern) {
        return None;
    }
    let compiled = Regex::new(&format!("(?i){pattern}")).ok()?;

    let probe: String = std::iter::repeat('a').take(PROBE_STRING_LEN).collect();
    let start = Instant::now();
    let _ = compiled.is_match(&probe);
    if start.elapsed() > PROBE_TIMEOUT {
        return None;
    }

    Some(compiled)
}
