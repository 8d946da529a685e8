use std::time::Duration;

use rand::Rng;

/// Reconnect delay policy for a host connection.
///
/// The original host client grew its delay by squaring it (10 -> 100 ->
/// 10_000 -> 100_000_000 ms), which stops being a retry schedule after the
/// fourth drop. That curve stays selectable for behavioural parity; new
/// sessions default to a capped exponential with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// `delay' = delay * delay`, uncapped.
    Squaring { floor_ms: u64 },
    /// `delay' = min(delay * 2, cap)`, with up to `jitter_ms` of random skew
    /// added to each wait.
    Exponential {
        floor_ms: u64,
        cap_ms: u64,
        jitter_ms: u64,
    },
}

impl ReconnectPolicy {
    /// The legacy curve, floor 10 ms.
    pub fn squaring() -> Self {
        ReconnectPolicy::Squaring { floor_ms: 10 }
    }

    /// Default policy: 250 ms floor, 30 s cap, 250 ms jitter.
    pub fn exponential() -> Self {
        ReconnectPolicy::Exponential {
            floor_ms: 250,
            cap_ms: 30_000,
            jitter_ms: 250,
        }
    }

    fn floor_ms(&self) -> u64 {
        match self {
            ReconnectPolicy::Squaring { floor_ms } => *floor_ms,
            ReconnectPolicy::Exponential { floor_ms, .. } => *floor_ms,
        }
    }
}

/// Per-connection backoff state. Owned exclusively by one host session and
/// reset to the policy floor on every successful open.
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: ReconnectPolicy,
    current_ms: u64,
}

impl BackoffState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_ms: policy.floor_ms(),
        }
    }

    /// Returns the wait before the next connection attempt and advances the
    /// state for the attempt after that.
    pub fn next_delay(&mut self) -> Duration {
        let wait_ms = self.current_ms;
        self.current_ms = match self.policy {
            ReconnectPolicy::Squaring { .. } => wait_ms.saturating_mul(wait_ms),
            ReconnectPolicy::Exponential { cap_ms, .. } => {
                wait_ms.saturating_mul(2).min(cap_ms)
            }
        };
        let jitter_ms = match self.policy {
            ReconnectPolicy::Exponential { jitter_ms, .. } if jitter_ms > 0 => {
                rand::thread_rng().gen_range(0..=jitter_ms)
            }
            _ => 0,
        };
        Duration::from_millis(wait_ms + jitter_ms)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.policy.floor_ms();
    }
}
