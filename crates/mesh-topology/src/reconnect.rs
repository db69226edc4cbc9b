/// Reconnect backoff and redial timers.
use std::collections::HashMap;
use std::time::Duration;

use tokio::task::AbortHandle;

/// First backoff step.
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(250);

/// Longest delay a timer accepts (2^31 - 1 ms).
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(2_147_483_647);

/// Exponential backoff for redialling lost desired peers.
///
/// The delay after the `n`-th consecutive failure is `base * 2^n`:
/// 500 ms, 1 s, 2 s, ... with the default base. There is no ceiling
/// besides [`MAX_TIMER_DELAY`] unless `max_delay` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RECONNECT_BASE,
            max_delay: None,
        }
    }
}

impl ReconnectPolicy {
    /// Cap every delay at `max`.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = Some(max);
        self
    }

    /// Delay before the redial that follows the `retries`-th failure.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        let ceiling = self
            .max_delay
            .map_or(MAX_TIMER_DELAY, |max| max.min(MAX_TIMER_DELAY));
        self.base.saturating_mul(factor).min(ceiling)
    }
}

/// Identifies one armed reconnect timer. A due timer whose ticket no longer
/// matches the peer's is stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReconnectTicket(u64);

impl ReconnectTicket {
    pub(crate) fn new(n: u64) -> Self {
        Self(n)
    }
}

/// Armed reconnect timers, one tokio task each.
#[derive(Debug, Default)]
pub(crate) struct ReconnectScheduler {
    timers: HashMap<ReconnectTicket, AbortHandle>,
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_due` after `delay` unless cancelled first.
    pub fn schedule<F>(&mut self, ticket: ReconnectTicket, delay: Duration, on_due: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_due();
        });
        if let Some(previous) = self.timers.insert(ticket, task.abort_handle()) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, ticket: ReconnectTicket) {
        if let Some(timer) = self.timers.remove(&ticket) {
            timer.abort();
        }
    }

    /// Forget a timer that has already fired.
    pub fn fired(&mut self, ticket: ReconnectTicket) {
        self.timers.remove(&ticket);
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }
}
