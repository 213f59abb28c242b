/*!
 # Schedule watcher

 Re-fetches the timetable at fixed times of day and asks the supervisor
 for a fresh daily run whenever it differs from the one loaded.
*/

use chrono::{Duration, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{wait_until, Clock, Wait};
use crate::config::SourceSettings;
use crate::source::{fetch_with_retry, ReservationSource};
use crate::supervisor::RunState;

/// Result of one timetable check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// Same timetable as the one loaded
    Unchanged,
    /// A different timetable was stored and a restart requested
    Changed,
    /// No timetable could be fetched this cycle
    FetchFailed,
}

/// First of `times` strictly after `now`, rolling over to tomorrow
pub fn next_check_after(now: NaiveDateTime, times: &[NaiveTime]) -> Option<NaiveDateTime> {
    let today = now.date();
    let later_today = times
        .iter()
        .map(|time| today.and_time(*time))
        .filter(|at| *at > now)
        .min();
    later_today.or_else(|| {
        let tomorrow = today + Duration::days(1);
        times.iter().min().map(|time| tomorrow.and_time(*time))
    })
}

/// Periodic timetable checker
pub struct ScheduleWatcher<S: ?Sized, C> {
    source: Arc<S>,
    clock: C,
    state: Arc<RunState>,
    settings: SourceSettings,
    checks: Vec<NaiveTime>,
    shutdown: CancellationToken,
}

impl<S, C> ScheduleWatcher<S, C>
where
    S: ReservationSource + ?Sized,
    C: Clock,
{
    pub fn new(
        source: Arc<S>,
        clock: C,
        state: Arc<RunState>,
        settings: SourceSettings,
        checks: Vec<NaiveTime>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            clock,
            state,
            settings,
            checks,
            shutdown,
        }
    }

    /// Fetches the timetable and compares it with the loaded one
    #[instrument(skip(self))]
    pub async fn check_and_update(&self) -> CheckResult {
        info!("Checking for updated reservations");
        let fetched = fetch_with_retry(
            self.source.as_ref(),
            &self.clock,
            self.settings.attempts,
            self.settings.retry_delay(),
            &self.shutdown,
        )
        .await;

        let Some(timeline) = fetched else {
            error!("Failed to fetch updated reservations");
            return CheckResult::FetchFailed;
        };

        if self.state.current_timeline().as_ref() == Some(&timeline) {
            info!("No changes in reservations");
            return CheckResult::Unchanged;
        }

        info!("Reservations have changed. Restarting the daily routine.");
        self.state.set_timeline(timeline);
        self.state.request_restart();
        CheckResult::Changed
    }

    /// Checks at every configured time until shutdown
    pub async fn run(self) {
        loop {
            let Some(next) = next_check_after(self.clock.now(), &self.checks) else {
                warn!("No reservation checks configured");
                self.shutdown.cancelled().await;
                return;
            };
            debug!("Next reservation check at {}", next.format("%Y-%m-%d %H:%M"));

            if wait_until(&self.clock, next, &self.shutdown).await == Wait::Interrupted {
                debug!("Schedule watcher stopping");
                return;
            }
            self.check_and_update().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::source::ReservationPayload;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn monday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap().and_time(hm(h, m))
    }

    /// Source whose timetable the test can swap between checks
    struct Swappable(Mutex<Option<ReservationPayload>>);

    #[async_trait]
    impl ReservationSource for Swappable {
        async fn fetch(&self) -> Result<ReservationPayload> {
            self.0
                .lock()
                .clone()
                .ok_or_else(|| Error::Fetch("503 Service Unavailable".into()))
        }
    }

    fn payload(entries: &[(&str, &str)]) -> Option<ReservationPayload> {
        Some(ReservationPayload {
            reservations: entries
                .iter()
                .map(|(t, c)| (t.to_string(), vec![c.to_string()]))
                .collect(),
            last_updated: None,
        })
    }

    fn watcher(source: Arc<Swappable>, state: Arc<RunState>) -> ScheduleWatcher<Swappable, ManualClock> {
        ScheduleWatcher::new(
            source,
            ManualClock::new(monday(18, 20)),
            state,
            SourceSettings::default(),
            vec![hm(18, 20)],
            CancellationToken::new(),
        )
    }

    #[test]
    fn next_check_later_today() {
        let checks = [hm(5, 20), hm(6, 20), hm(18, 20)];
        assert_eq!(next_check_after(monday(6, 0), &checks), Some(monday(6, 20)));
        assert_eq!(next_check_after(monday(6, 20), &checks), Some(monday(18, 20)));
    }

    #[test]
    fn next_check_rolls_over_to_tomorrow() {
        let checks = [hm(21, 20), hm(5, 20)];
        let tomorrow = NaiveDate::from_ymd_opt(2024, 9, 3).unwrap().and_time(hm(5, 20));
        assert_eq!(next_check_after(monday(22, 0), &checks), Some(tomorrow));
        assert_eq!(next_check_after(monday(22, 0), &[]), None);
    }

    #[tokio::test]
    async fn identical_timetables_never_restart() {
        let source = Arc::new(Swappable(Mutex::new(payload(&[("19:30", "Full Court")]))));
        let state = RunState::new();
        let watcher = watcher(Arc::clone(&source), Arc::clone(&state));

        // nothing loaded yet, so the first successful fetch is a change
        assert_eq!(watcher.check_and_update().await, CheckResult::Changed);
        let guard = state.try_begin_run(CancellationToken::new()).unwrap();
        assert_eq!(watcher.check_and_update().await, CheckResult::Unchanged);
        assert_eq!(watcher.check_and_update().await, CheckResult::Unchanged);
        assert!(!guard.token().is_cancelled());
    }

    #[tokio::test]
    async fn one_differing_entry_restarts_the_run() {
        let source = Arc::new(Swappable(Mutex::new(payload(&[
            ("19:30", "Full Court"),
            ("20:30", "Half Court A"),
        ]))));
        let state = RunState::new();
        let watcher = watcher(Arc::clone(&source), Arc::clone(&state));
        watcher.check_and_update().await;

        let guard = state.try_begin_run(CancellationToken::new()).unwrap();
        *source.0.lock() = payload(&[("19:30", "Full Court"), ("20:30", "Half Court B")]);

        assert_eq!(watcher.check_and_update().await, CheckResult::Changed);
        assert!(guard.token().is_cancelled());
        let loaded = state.current_timeline().unwrap();
        assert!(loaded.iter().any(|i| i.courts.contains("Half Court B")));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_the_loaded_timeline() {
        let source = Arc::new(Swappable(Mutex::new(payload(&[("19:30", "Full Court")]))));
        let state = RunState::new();
        let watcher = watcher(Arc::clone(&source), Arc::clone(&state));
        watcher.check_and_update().await;
        let before = state.current_timeline();

        *source.0.lock() = None;
        let guard = state.try_begin_run(CancellationToken::new()).unwrap();
        assert_eq!(watcher.check_and_update().await, CheckResult::FetchFailed);
        assert_eq!(state.current_timeline(), before);
        assert!(!guard.token().is_cancelled());
    }

    #[tokio::test]
    async fn malformed_timetable_does_not_replace_the_loaded_one() {
        let source = Arc::new(Swappable(Mutex::new(payload(&[("19:30", "Full Court")]))));
        let state = RunState::new();
        let watcher = watcher(Arc::clone(&source), Arc::clone(&state));
        watcher.check_and_update().await;
        let before = state.current_timeline();

        *source.0.lock() = payload(&[("7.30pm", "Full Court")]);
        assert_eq!(watcher.check_and_update().await, CheckResult::FetchFailed);
        assert_eq!(state.current_timeline(), before);
    }
}
