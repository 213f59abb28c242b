/*!
 # Wall-clock access and cancellable waits

 Everything that reads the time of day or sleeps goes through [`Clock`], so
 a whole day of lighting transitions can be replayed against a
 [`ManualClock`] without real delay.
*/

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Source of local wall-clock time and of sleeping
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current local date and time
    fn now(&self) -> NaiveDateTime;

    /// Suspends the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// The real local clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock whose `sleep` advances time instantly
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward without sleeping, e.g. to model slow I/O
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += to_chrono(duration);
    }

    /// Jumps the clock to an absolute time
    pub fn set(&self, at: NaiveDateTime) {
        *self.now.lock() = at;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The target time was reached
    Reached,
    /// Shutdown was requested before the target time
    Interrupted,
}

/// Converts a std duration to chrono, saturating on overflow
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Time left until `target`, zero if it has passed
pub fn remaining(now: NaiveDateTime, target: NaiveDateTime) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Waits for `target` with a single sleep that shutdown can still preempt
pub async fn wait_until<C: Clock + ?Sized>(
    clock: &C,
    target: NaiveDateTime,
    shutdown: &CancellationToken,
) -> Wait {
    if shutdown.is_cancelled() {
        return Wait::Interrupted;
    }
    let left = remaining(clock.now(), target);
    if left.is_zero() {
        return Wait::Reached;
    }

    debug!("Waiting {:?} until {}", left, target.format("%H:%M:%S"));
    tokio::select! {
        _ = clock.sleep(left) => Wait::Reached,
        _ = shutdown.cancelled() => Wait::Interrupted,
    }
}

/// Waits for `target` in steps of at most `interval`, re-reading the clock
/// after every wake and checking shutdown before every step
pub async fn poll_until<C: Clock + ?Sized>(
    clock: &C,
    target: NaiveDateTime,
    interval: Duration,
    shutdown: &CancellationToken,
) -> Wait {
    loop {
        if shutdown.is_cancelled() {
            debug!("Shutdown requested while waiting for {}", target.format("%H:%M:%S"));
            return Wait::Interrupted;
        }
        let left = remaining(clock.now(), target);
        if left.is_zero() {
            return Wait::Reached;
        }
        let step = left.min(interval);
        trace!("Polling: sleeping {:?}, {:?} left", step, left);
        clock.sleep(step).await;
    }
}
