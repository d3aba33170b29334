//! Reference plugin implementations (§4.4). These are example bodies, not
//! part of the plugin *contract* itself ([`crate::plugin::Plugin`]) — hosts
//! are free to bring their own and simply register them in
//! [`crate::engine::EngineConfig::plugins`] alongside, or instead of, these.

pub mod kill_switch;
pub mod output_validator;
pub mod rate_limiter;
pub mod session_budget;

pub use kill_switch::{KillSwitch, KillSwitchPersistence, KillSwitchState};
pub use output_validator::{OutputValidator, OutputValidatorConfig, OutputViolation};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use session_budget::SessionBudget;
