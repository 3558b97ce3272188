//! Retry policies, RPC error classification and reconnect backoff.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::InvocationError;

// ─── Classification ───────────────────────────────────────────────────────────

/// Which `*_MIGRATE_<dc>` error the server sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateKind {
    /// `PHONE_MIGRATE`: the account lives on another DC.
    Phone,
    /// `NETWORK_MIGRATE`: the client should use another DC from now on.
    Network,
    /// `USER_MIGRATE`: the user's data lives on another DC.
    User,
    /// `FILE_MIGRATE`: only this file lives elsewhere.
    File,
    /// `STATS_MIGRATE`: only these statistics live elsewhere.
    Stats,
}

impl MigrateKind {
    /// Whether the home DC moves along with the request.
    pub fn moves_home(self) -> bool {
        matches!(self, Self::Phone | Self::Network | Self::User)
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "PHONE_MIGRATE"   => Self::Phone,
            "NETWORK_MIGRATE" => Self::Network,
            "USER_MIGRATE"    => Self::User,
            "FILE_MIGRATE"    => Self::File,
            "STATS_MIGRATE"   => Self::Stats,
            _ => return None,
        })
    }
}

/// What the dispatcher should do with a failed call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Wait this long, then send again.
    FloodWait(Duration),
    /// Send again on `dc`.
    Migrate { kind: MigrateKind, dc: i32 },
    /// Hand the error to the caller (subject to the [`RetryPolicy`]).
    Surface,
}

/// Map a failed call onto a [`Decision`].
pub fn classify(error: &InvocationError) -> Decision {
    let InvocationError::Rpc(rpc) = error else {
        return Decision::Surface;
    };
    if let Some(secs) = rpc.flood_wait_seconds() {
        return Decision::FloodWait(Duration::from_secs(secs));
    }
    if rpc.code == 303 {
        if let (Some(kind), Some(dc)) = (MigrateKind::from_name(&rpc.name), rpc.value) {
            return Decision::Migrate { kind, dc: dc as i32 };
        }
    }
    Decision::Surface
}

// ─── RetryPolicy ──────────────────────────────────────────────────────────────

/// Controls how the client reacts when an RPC call fails.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext {
    pub fail_count:   NonZeroU32,
    pub slept_so_far: Duration,
    pub error:        InvocationError,
}

/// Never retry.
pub struct NoRetries;
impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Retry once after a short sleep on I/O errors.
///
/// Short `FLOOD_WAIT`s never reach the policy: the client sleeps through
/// every one up to `Config::flood_sleep_threshold` on its own.
pub struct AutoSleep {
    pub io_errors_as_flood_of: Option<Duration>,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self { io_errors_as_flood_of: Some(Duration::from_secs(1)) }
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if matches!(ctx.error, InvocationError::Io(_)) && ctx.fail_count.get() == 1 {
            if let Some(d) = self.io_errors_as_flood_of {
                tracing::info!("[ferry] I/O error, sleeping {d:?} before retry");
                return ControlFlow::Continue(d);
            }
        }
        ControlFlow::Break(())
    }
}

// ─── Backoff ──────────────────────────────────────────────────────────────────

/// Exponential reconnect delay: `base * 2^attempt`, capped at `max`, then
/// scaled by a random factor in `1 ± jitter`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub base:   Duration,
    pub max:    Duration,
    /// Fraction in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base:   Duration::from_millis(500),
            max:    Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rnd = [0u8; 4];
        getrandom::getrandom(&mut rnd).expect("getrandom");
        // Map to -1.0..=1.0.
        let unit = u32::from_le_bytes(rnd) as f64 / u32::MAX as f64 * 2.0 - 1.0;
        self.delay_with(attempt, unit)
    }

    /// [`Self::delay`] with the random factor supplied (`-1.0..=1.0`).
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(20));
        let capped = exp.min(self.max);
        let factor = 1.0 + self.jitter.clamp(0.0, 1.0) * unit.clamp(-1.0, 1.0);
        capped.mul_f64(factor)
    }
}
