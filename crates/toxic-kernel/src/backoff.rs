//! Reconnect policy: what to do, and how long to wait, after a disconnect.
//!
//! The policy is pure. It receives the disconnect class and the current
//! failure counter, updates the counter, and returns a [`Decision`]. All
//! timers and side effects live in the orchestrator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::disconnect::DisconnectClass;

/// Reconnect timings and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first backed-off retry.
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Growth per failed attempt for [`DisconnectClass::Transient`].
    pub transient_growth: f64,
    /// Growth per failed attempt for [`DisconnectClass::Unknown`].
    pub unknown_growth: f64,
    /// Upper bound on any backed-off delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Failed attempts allowed before a cooldown.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub cooldown: Duration,
    #[serde(with = "millis")]
    pub logged_out_delay: Duration,
    #[serde(with = "millis")]
    pub restart_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(3_000),
            transient_growth: 1.3,
            unknown_growth: 1.5,
            max_delay: Duration::from_millis(45_000),
            max_attempts: 25,
            cooldown: Duration::from_millis(60_000),
            logged_out_delay: Duration::from_millis(3_000),
            restart_delay: Duration::from_millis(2_000),
        }
    }
}

/// The reaction chosen for one disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Delete session credentials, then reconnect after `delay`.
    WipeSession { delay: Duration },
    /// Reconnect after `delay` without counting a failure.
    Restart { delay: Duration },
    /// Counted failure number `attempt`; reconnect after `delay`.
    Backoff { delay: Duration, attempt: u32 },
    /// The attempt budget is spent; the counter was reset.
    Cooldown { delay: Duration },
}

impl Decision {
    pub fn delay(&self) -> Duration {
        match *self {
            Self::WipeSession { delay }
            | Self::Restart { delay }
            | Self::Backoff { delay, .. }
            | Self::Cooldown { delay } => delay,
        }
    }
}

impl ReconnectPolicy {
    /// Decide how to react to a disconnect of `class`.
    ///
    /// `attempt_count` is only read and written for the backed-off classes.
    pub fn decide(&self, class: DisconnectClass, attempt_count: &mut u32) -> Decision {
        let growth = match class {
            DisconnectClass::LoggedOut => {
                return Decision::WipeSession {
                    delay: self.logged_out_delay,
                };
            }
            DisconnectClass::RestartRequired => {
                return Decision::Restart {
                    delay: self.restart_delay,
                };
            }
            DisconnectClass::Transient => self.transient_growth,
            DisconnectClass::Unknown => self.unknown_growth,
        };

        if *attempt_count >= self.max_attempts {
            *attempt_count = 0;
            return Decision::Cooldown {
                delay: self.cooldown,
            };
        }

        let delay = self.backoff_delay(growth, *attempt_count);
        *attempt_count += 1;
        Decision::Backoff {
            delay,
            attempt: *attempt_count,
        }
    }

    /// `min(base × growth^attempts, max_delay)`, rounded to whole
    /// milliseconds.
    pub fn backoff_delay(&self, growth: f64, attempts: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let cap_ms = self.max_delay.as_millis() as f64;
        // f64::min discards NaN, so a degenerate growth still lands on the cap.
        let ms = (base_ms * growth.powf(f64::from(attempts))).min(cap_ms);
        Duration::from_millis(ms.max(0.0).round() as u64)
    }
}

/// Serde helper: durations as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
