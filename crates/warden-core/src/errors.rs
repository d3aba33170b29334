//! Error taxonomy (§7). Configuration errors surface from the loader at
//! construction/reload time; programmer errors surface at `check` entry;
//! policy decision errors never throw — they become DENY events instead and
//! are not represented here at all.

use thiserror::Error;

/// Errors raised while loading, validating, or verifying a policy bundle.
///
/// Signature failures are deliberately collapsed into a single generic
/// variant (`SignatureVerificationFailed`) with no detail: revealing which
/// check failed would help an attacker iterate toward a forged bundle.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("policy path escapes the allowed base directory: {0}")]
    PathTraversal(String),

    #[error("policy path is a symbolic link: {0}")]
    SymlinkRejected(String),

    #[error("policy path is not a regular file: {0}")]
    NotRegularFile(String),

    #[error("policy file not found: {0}")]
    FileNotFound(String),

    #[error("policy source too large: {actual} bytes exceeds limit of {limit} bytes")]
    TooLarge { actual: u64, limit: u64 },

    #[error("failed to parse policy bundle: {0}")]
    ParseError(String),

    #[error("policy bundle nesting exceeds maximum depth of {limit}")]
    ExcessiveDepth { limit: u32 },

    #[error("policy bundle field {field} is missing or has the wrong type: {detail}")]
    ShapeInvalid { field: String, detail: String },

    #[error("policy bundle has {actual} rules, exceeding the limit of {limit}")]
    TooManyRules { actual: usize, limit: usize },

    #[error("policy bundle timestamp is invalid: {0}")]
    InvalidTimestamp(String),

    #[error("policy bundle generated_at must be before expires_at")]
    GeneratedAfterExpiry,

    #[error("policy bundle has expired")]
    Expired,

    #[error("signature verification failed — policy may have been tampered with")]
    SignatureVerificationFailed,

    #[error("no host-supplied async policy source was configured")]
    NoAsyncSource,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Engine-level programmer errors (§7 "Programmer errors").
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine used before initialization completed")]
    NotInitialized,

    #[error("no policy source configured")]
    MissingPolicySource,

    #[error("invalid check() arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Loader(#[from] LoaderError),
}

/// The distinguished error `protect()` raises when the wrapped call is
/// denied. Carries the decision so callers can inspect why.
#[derive(Debug, Error)]
#[error("security blocked: {} - {}", .decision.outcome_code(), Self::summarize(&.decision))]
pub struct SecurityBlockedError {
    pub decision: crate::schema::Decision,
}

impl SecurityBlockedError {
    fn summarize(decision: &crate::schema::Decision) -> String {
        decision
            .reasons
            .first()
            .map(|r| r.message.clone())
            .unwrap_or_default()
    }
}

impl crate::schema::Decision {
    fn outcome_code(&self) -> &'static str {
        match self.outcome {
            crate::schema::Outcome::Allow => "ALLOW",
            crate::schema::Outcome::Deny => "DENY",
            crate::schema::Outcome::RequireApproval => "REQUIRE_APPROVAL",
            crate::schema::Outcome::StepUp => "STEP_UP",
            crate::schema::Outcome::RequireTicket => "REQUIRE_TICKET",
            crate::schema::Outcome::RequireHuman => "REQUIRE_HUMAN",
        }
    }
}
