//! Reconnection decisions for the shared connection.
//!
//! Pure functions without side effects, used by the connection supervisor.

use std::time::Duration;

use crate::{config::ReconnectPolicy, error::TransportError};

/// Check if the supervisor must stop instead of retrying.
///
/// A rejected credential will be rejected again; only a fresh login helps.
pub fn should_exit_immediately(error: &TransportError) -> bool {
    matches!(error, TransportError::AuthRejected(_))
}

/// Check if another connect attempt should be made.
///
/// # Arguments
///
/// * `error` - The last connect failure, if any
/// * `current_attempt` - Attempts made since the last successful connection (0-indexed)
/// * `policy` - The reconnection policy
pub fn should_attempt_reconnect(
    error: Option<&TransportError>,
    current_attempt: u32,
    policy: &ReconnectPolicy,
) -> bool {
    if error.is_some_and(should_exit_immediately) {
        return false;
    }

    match policy.max_attempts {
        Some(max_attempts) => current_attempt < max_attempts,
        None => true,
    }
}

/// Delay before attempt `current_attempt`: `initial * 2^attempt`, capped at `max_backoff`.
pub fn backoff_delay(current_attempt: u32, policy: &ReconnectPolicy) -> Duration {
    let factor = 2u32.saturating_pow(current_attempt.min(16));
    policy
        .initial_backoff
        .saturating_mul(factor)
        .min(policy.max_backoff)
}
