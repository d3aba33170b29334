//! Process exit codes for `warden`. Coarse, stable, CI-friendly — mirrors
//! the teacher CLI's `exit_codes.rs` convention of a small closed set rather
//! than raw `errno`-style codes.

/// The command completed successfully.
pub const SUCCESS: i32 = 0;

/// The bundle failed validation, verification, or the simulated request was
/// denied — a normal, expected negative outcome, not a tool malfunction.
pub const POLICY_REJECTED: i32 = 1;

/// Bad arguments, unreadable files, or malformed JSON — a user/config error.
pub const USAGE_ERROR: i32 = 2;
