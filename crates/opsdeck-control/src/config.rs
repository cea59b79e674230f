use std::time::Duration;

use once_cell::sync::Lazy;

use crate::poller::PollPolicy;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_policy(ms_key: &str, attempts_key: &str, default_ms: u64, default_attempts: u32) -> PollPolicy {
    let interval_ms = env_u64(ms_key, default_ms).max(100);
    let attempts = env_u64(attempts_key, u64::from(default_attempts)).max(1) as u32;
    PollPolicy::new(Duration::from_millis(interval_ms), attempts)
}

const DEFAULT_RESULT_SNAPSHOT_MAX_BYTES: usize = 64 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 20;

static DEFAULT_RESTART_POLL: Lazy<PollPolicy> = Lazy::new(|| {
    env_policy(
        "OPSDECK_RESTART_POLL_MS",
        "OPSDECK_RESTART_POLL_ATTEMPTS",
        2_000,
        15,
    )
});

static DEFAULT_DISCOVERY_POLL: Lazy<PollPolicy> = Lazy::new(|| {
    env_policy(
        "OPSDECK_DISCOVERY_POLL_MS",
        "OPSDECK_DISCOVERY_POLL_ATTEMPTS",
        2_000,
        5,
    )
});

static DEFAULT_CONTROL_POLL: Lazy<PollPolicy> = Lazy::new(|| {
    env_policy(
        "OPSDECK_CONTROL_POLL_MS",
        "OPSDECK_CONTROL_POLL_ATTEMPTS",
        1_000,
        10,
    )
});

/// Tunables for the control plane. Poll budgets are differentiated per
/// operation class: an env-apply restart window is materially longer than a
/// plain start/stop confirmation.
#[derive(Clone, Debug)]
pub struct ControlOptions {
    /// Poll budget while awaiting the autonomous restart after an env apply.
    pub restart_poll: PollPolicy,
    /// Poll budget while awaiting capability re-discovery.
    pub discovery_poll: PollPolicy,
    /// Poll budget while confirming a start/stop/restart control action.
    pub control_poll: PollPolicy,
    /// Bound N on each per-(target, capability) history log.
    pub history_limit: usize,
    /// Result payloads above this size are replaced by a truncation marker
    /// before they are recorded.
    pub result_snapshot_max_bytes: usize,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            restart_poll: *DEFAULT_RESTART_POLL,
            discovery_poll: *DEFAULT_DISCOVERY_POLL,
            control_poll: *DEFAULT_CONTROL_POLL,
            history_limit: env_usize("OPSDECK_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT).max(1),
            result_snapshot_max_bytes: env_usize(
                "OPSDECK_RESULT_SNAPSHOT_MAX_BYTES",
                DEFAULT_RESULT_SNAPSHOT_MAX_BYTES,
            )
            .max(1),
        }
    }
}
