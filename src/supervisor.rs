/*!
 # Supervisor

 Owns the process-wide run state and drives daily runs: one at start-up,
 one every morning at the configured start time, and a fresh one whenever
 the schedule watcher reports a changed timetable. A restart never patches
 a run in flight; the old run is cancelled at its next poll and the new one
 refetches the timetable and reconnects the devices from scratch.
*/

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::clock::{wait_until, Clock};
use crate::config::Config;
use crate::device;
use crate::orchestrator::{DailyOrchestrator, RunOutcome};
use crate::reservation::Timeline;
use crate::source::{fetch_with_retry, ReservationSource};
use crate::watcher::{next_check_after, ScheduleWatcher};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    current_timeline: Option<Timeline>,
    daily_run_in_flight: bool,
    run_token: Option<CancellationToken>,
}

/// State shared between the daily run and the schedule watcher
#[derive(Debug, Default)]
pub struct RunState {
    inner: Mutex<Inner>,
    restart: Notify,
}

impl RunState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Timeline most recently loaded, if any
    pub fn current_timeline(&self) -> Option<Timeline> {
        self.inner.lock().current_timeline.clone()
    }

    pub fn set_timeline(&self, timeline: Timeline) {
        self.inner.lock().current_timeline = Some(timeline);
    }

    pub fn is_run_in_flight(&self) -> bool {
        self.inner.lock().daily_run_in_flight
    }

    /// Marks a daily run as started, unless one already is.
    ///
    /// The run is cancelled through `token` on restart; dropping the guard
    /// marks the run as finished.
    pub fn try_begin_run(self: &Arc<Self>, token: CancellationToken) -> Option<RunGuard> {
        let mut inner = self.inner.lock();
        if inner.daily_run_in_flight {
            return None;
        }
        inner.daily_run_in_flight = true;
        inner.run_token = Some(token.clone());
        Some(RunGuard {
            state: Arc::clone(self),
            token,
        })
    }

    /// Cancels the run in flight, if any, and wakes the supervisor
    pub fn request_restart(&self) {
        if let Some(token) = self.inner.lock().run_token.as_ref() {
            token.cancel();
        }
        self.restart.notify_one();
    }

    /// Resolves once a restart has been requested
    pub async fn restart_requested(&self) {
        self.restart.notified().await;
    }
}

/// Marks a daily run as in flight for as long as it lives
#[derive(Debug)]
pub struct RunGuard {
    state: Arc<RunState>,
    token: CancellationToken,
}

impl RunGuard {
    /// Cancelled on shutdown or restart
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut inner = self.state.inner.lock();
        inner.daily_run_in_flight = false;
        inner.run_token = None;
    }
}

/// Top-level driver of daily runs
pub struct Supervisor<S, C> {
    config: Config,
    source: Arc<S>,
    clock: C,
    state: Arc<RunState>,
    shutdown: CancellationToken,
}

impl<S, C> Supervisor<S, C>
where
    S: ReservationSource + 'static,
    C: Clock + Clone + 'static,
{
    pub fn new(config: Config, source: Arc<S>, clock: C, shutdown: CancellationToken) -> Self {
        Self {
            config,
            source,
            clock,
            state: RunState::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> Arc<RunState> {
        Arc::clone(&self.state)
    }

    /// Watcher sharing this supervisor's state
    pub fn watcher(&self) -> ScheduleWatcher<S, C> {
        ScheduleWatcher::new(
            Arc::clone(&self.source),
            self.clock.clone(),
            Arc::clone(&self.state),
            self.config.source.clone(),
            self.config.watcher.checks.clone(),
            self.shutdown.clone(),
        )
    }

    /// One daily run: fetch, connect, orchestrate.
    ///
    /// Returns `Ok(None)` without doing anything if a run is already in flight.
    #[instrument(skip(self))]
    pub async fn daily_routine(&self) -> Result<Option<RunOutcome>> {
        let Some(guard) = self.state.try_begin_run(self.shutdown.child_token()) else {
            info!("Daily routine is already running. Skipping.");
            return Ok(None);
        };
        info!(
            "Starting daily routine at {}",
            self.clock.now().format("%Y-%m-%d %H:%M:%S")
        );

        let source = &self.config.source;
        let timeline = fetch_with_retry(
            self.source.as_ref(),
            &self.clock,
            source.attempts,
            source.retry_delay(),
            &guard.token(),
        )
        .await
        .ok_or_else(|| Error::Fetch("no timetable available for today".into()))?;

        info!("Reservations fetched:");
        for interval in &timeline {
            let courts: Vec<&str> = interval.courts.iter().map(String::as_str).collect();
            info!(
                "Time: {}, Courts: {}",
                interval.start.format("%H:%M"),
                courts.join(", ")
            );
        }
        self.state.set_timeline(timeline.clone());

        let mut devices = device::connect(&self.config.devices).await?;
        let mut orchestrator = DailyOrchestrator::new(
            &mut devices,
            self.clock.clone(),
            self.config.timing.clone(),
            self.config.windows.clone(),
            guard.token(),
        );
        let outcome = orchestrator.run(&timeline).await?;

        match outcome {
            RunOutcome::Completed => info!("Daily routine completed successfully"),
            RunOutcome::Interrupted => warn!("Daily routine stopped before the end of the day"),
        }
        Ok(Some(outcome))
    }

    /// Runs until shutdown: a daily run now, then one per morning or per
    /// timetable change, with the watcher checking in the background
    pub async fn run(self) -> Result<()> {
        info!("Starting the court lighting management system");
        let watcher = tokio::spawn(self.watcher().run());
        info!("Reservation checks scheduled");

        while !self.shutdown.is_cancelled() {
            if let Err(e) = self.daily_routine().await {
                error!("Skipping light control for today: {}", e);
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            let daily_start = self.config.watcher.daily_start;
            let Some(next) = next_check_after(self.clock.now(), &[daily_start]) else {
                break;
            };
            info!("Next daily routine scheduled at {}", next.format("%Y-%m-%d %H:%M"));

            // a pending restart wins over the morning run
            tokio::select! {
                biased;
                _ = self.state.restart_requested() => {
                    info!("Reservations have changed. Restarting the daily routine.");
                }
                _ = wait_until(&self.clock, next, &self.shutdown) => {}
            }
        }

        info!("Exiting the application...");
        if let Err(e) = watcher.await {
            error!("Schedule watcher ended abnormally: {}", e);
        }
        Ok(())
    }
}
