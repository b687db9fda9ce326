use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Bounded exponential retry delays: `initial`, doubled per failure, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: u32,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            multiplier: 2,
            cap,
        }
    }

    /// Subscribe-side reconnects: 1s doubling up to 60s.
    pub const fn ingress() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Publish-side reconnects: 1s doubling up to 30s.
    pub const fn egress() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.initial.min(self.cap),
        }
    }
}

/// Running state of one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait after a failed attempt and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .saturating_mul(self.policy.multiplier)
            .min(self.policy.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial.min(self.policy.cap);
    }
}

/// The clock retry loops wait on. Tests swap in `RecordingSleeper`.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested delay.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(delays) => delays.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        match self.delays.lock() {
            Ok(mut delays) => delays.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
        tokio::task::yield_now().await;
    }
}
