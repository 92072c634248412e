//! Exponential backoff for retrying failed drains.
//!
//! # Backoff Schedule (defaults)
//!
//! | Attempt | Delay (base) | With ±25% jitter |
//! |---------|-------------|------------------|
//! | 0       | 500ms       | 375–625ms        |
//! | 1       | 1s          | 0.75–1.25s       |
//! | 2       | 2s          | 1.5–2.5s         |
//! | 3       | 4s          | 3–5s             |
//! | 4       | 8s          | 6–10s            |
//! | 5       | 16s         | 12–20s           |
//! | 6+      | 30s (cap)   | 22.5–37.5s       |

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tasklane_core::Config;

/// Configuration for the exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first retry (default: 500ms).
    pub base_delay: Duration,
    /// Maximum delay cap before jitter (default: 30s).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(tasklane_core::config::DEFAULT_RETRY_BASE_MS),
            max_delay: Duration::from_millis(tasklane_core::config::DEFAULT_RETRY_MAX_MS),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            base_delay: config.retry_base,
            max_delay: config.retry_max,
        }
    }

    /// Delay for a given attempt (0-indexed).
    ///
    /// Formula: `min(base_delay * 2^attempt, max_delay)` + ±25% jitter.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        #[allow(clippy::cast_possible_wrap)]
        let exponent = attempt.min(62) as i32;
        let raw = (base_ms * 2.0_f64.powi(exponent)).min(max_ms);

        let jittered = raw.mul_add(0.25 * jitter_factor(), raw);
        let clamped = jittered.max(10.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ms = clamped as u64;
        Duration::from_millis(ms)
    }
}

/// Jitter factor in `[-1.0, 1.0]` from a simple LCG.
///
/// Only needs to break synchronization between handles.
fn jitter_factor() -> f64 {
    static SEED: AtomicU64 = AtomicU64::new(0);

    if SEED.load(Ordering::Relaxed) == 0 {
        let init = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(12_345, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        SEED.compare_exchange(0, init, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
    }

    // LCG: x' = (a*x + c) mod 2^64
    let a: u64 = 6_364_136_223_846_793_005;
    let c: u64 = 1_442_695_040_888_963_407;
    let val = SEED
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.wrapping_mul(a).wrapping_add(c))
        })
        .unwrap_or(42);

    #[allow(clippy::cast_precision_loss)]
    let mapped = (val as f64 / u64::MAX as f64).mul_add(2.0, -1.0);
    mapped
}
