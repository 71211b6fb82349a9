//! Busy-poll pacing for blocking sync.
//!
//! Blocking sync never calls a runtime-level wait; it re-reads the completion
//! signal in a loop. [`PollPolicy`] controls how the host thread is paced
//! between reads: an exponentially growing spin (`1, 2, 4, ..` up to
//! `spin_limit` spin-loop hints) and, after `yield_threshold` polls, a
//! `yield_now` between reads so long kernels do not starve sibling threads.

use serde::{Deserialize, Serialize};

/// Pacing between completion polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Maximum spin-loop hints between two polls.
    #[serde(default = "default_spin_limit")]
    pub spin_limit: u32,
    /// Number of polls after which the thread yields between polls.
    #[serde(default = "default_yield_threshold")]
    pub yield_threshold: u32,
}

fn default_spin_limit() -> u32 {
    64
}

fn default_yield_threshold() -> u32 {
    128
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            spin_limit: default_spin_limit(),
            yield_threshold: default_yield_threshold(),
        }
    }
}

impl PollPolicy {
    /// Pure spinning, never yields. Lowest latency, burns a core.
    #[must_use]
    pub fn spin_only() -> Self {
        Self {
            spin_limit: default_spin_limit(),
            yield_threshold: u32::MAX,
        }
    }

    /// Yields between every poll.
    #[must_use]
    pub fn yielding() -> Self {
        Self {
            spin_limit: 1,
            yield_threshold: 0,
        }
    }

    /// Starts a fresh backoff sequence.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Per-wait backoff state.
#[derive(Debug)]
pub struct Backoff {
    policy: PollPolicy,
    attempt: u32,
}

impl Backoff {
    /// Pauses before the next poll.
    pub fn snooze(&mut self) {
        if self.attempt >= self.policy.yield_threshold {
            std::thread::yield_now();
        } else {
            for _ in 0..self.spins() {
                std::hint::spin_loop();
            }
        }
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Polls performed so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Spin count for the current attempt.
    #[must_use]
    pub fn spins(&self) -> u32 {
        let shift = self.attempt.min(31);
        (1u32 << shift).min(self.policy.spin_limit.max(1))
    }

    /// Whether the next snooze yields instead of spinning.
    #[must_use]
    pub fn is_yielding(&self) -> bool {
        self.attempt >= self.policy.yield_threshold
    }
}
