/*!
 # Daily lighting orchestrator

 Walks one day's timeline and switches the zones at every boundary:

 1. Weekend pre-activation: everything on from 04:30 to 05:30 on Saturdays
    and Sundays.
 2. Weekday pre-activation: everything on shortly before the first
    reservation.
 3. Reservation sweep: each slot in order, overridden by the daytime
    blackout and the evening all-on window.
 4. Wind-down: everything on, then the full fixture alone, then off.

 Every decision re-reads the clock, since device I/O eats real time. Waits
 inside the sweep and wind-down poll so shutdown is noticed within one
 poll interval; a zone command already in flight always completes.
*/

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::clock::{poll_until, to_chrono, wait_until, Clock, Wait};
use crate::config::{TimingSettings, WindowSettings};
use crate::control::apply_desired_state;
use crate::device::ZoneDevices;
use crate::reservation::{Timeline, SLOT_MINUTES};
use crate::zone::DesiredZoneState;
use crate::{Error, Result};

/// A slot is skipped once this many minutes of it have elapsed
pub const SKIP_AFTER_MINUTES: i64 = 59;

/// How a daily run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The whole day, wind-down included, was carried out
    Completed,
    /// Shutdown or a restart request stopped the run early
    Interrupted,
}

/// Marker for an early exit on shutdown
struct Interrupted;

type Step = std::result::Result<(), Interrupted>;

/// A half-open `[start, end)` window on the run's date
#[derive(Debug, Clone, Copy)]
struct Window {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl Window {
    fn contains(&self, at: NaiveDateTime) -> bool {
        self.start <= at && at < self.end
    }
}

/// Drives the zone devices through one day
pub struct DailyOrchestrator<'d, C: Clock> {
    devices: &'d mut ZoneDevices,
    clock: C,
    timing: TimingSettings,
    windows: WindowSettings,
    shutdown: CancellationToken,
}

impl<'d, C: Clock> DailyOrchestrator<'d, C> {
    pub fn new(
        devices: &'d mut ZoneDevices,
        clock: C,
        timing: TimingSettings,
        windows: WindowSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            devices,
            clock,
            timing,
            windows,
            shutdown,
        }
    }

    /// Runs the day's schedule to completion or until shutdown.
    ///
    /// An empty timeline fails before any light is touched.
    #[instrument(skip(self, timeline), fields(slots = timeline.len()))]
    pub async fn run(&mut self, timeline: &Timeline) -> Result<RunOutcome> {
        if timeline.is_empty() {
            error!("No reservations to process, leaving lights as they are");
            return Err(Error::EmptySchedule);
        }

        let today = self.clock.now().date();
        match self.run_phases(today, timeline).await {
            Ok(()) => Ok(RunOutcome::Completed),
            Err(Interrupted) => {
                info!("Daily run interrupted");
                Ok(RunOutcome::Interrupted)
            }
        }
    }

    async fn run_phases(&mut self, today: NaiveDate, timeline: &Timeline) -> Step {
        self.check_shutdown()?;
        if matches!(today.weekday(), Weekday::Sat | Weekday::Sun) {
            self.weekend_pre_activation(today).await?;
        } else {
            self.weekday_pre_activation(today, timeline).await?;
        }
        self.check_shutdown()?;
        self.reservation_sweep(today, timeline).await?;
        self.wind_down().await
    }

    #[instrument(skip(self))]
    async fn weekend_pre_activation(&mut self, today: NaiveDate) -> Step {
        info!("Today is a weekend. Activating weekend schedule.");
        let window = Window {
            start: today.and_time(self.windows.weekend_on),
            end: today.and_time(self.windows.weekend_off),
        };

        let mut now = self.clock.now();
        if now < window.start {
            info!(
                "Waiting until {} to turn on lights for the weekend morning",
                window.start.format("%H:%M")
            );
            self.wait(window.start).await?;
            now = self.clock.now();
        }

        if window.contains(now) {
            info!(
                "Turning on all lights for the weekend morning period ({} - {})",
                window.start.format("%H:%M"),
                window.end.format("%H:%M")
            );
            self.apply(DesiredZoneState::ALL_ON).await?;
            self.poll(window.end).await?;
            info!("Weekend morning period ended. Processing reservations.");
        }
        Ok(())
    }

    /// Everything on from `earliest - lead` until the first reservation.
    ///
    /// A run that starts inside the lead window still turns everything on
    /// right away, rather than leaving the sweep to hold the lights off
    /// until the slot begins. Nothing happens once the first slot started.
    #[instrument(skip(self, timeline))]
    async fn weekday_pre_activation(&mut self, today: NaiveDate, timeline: &Timeline) -> Step {
        let Some(first) = timeline.first() else {
            return Ok(());
        };
        let earliest = today.and_time(first.start);
        let activation = earliest - self.windows.weekday_lead();

        if self.clock.now() >= earliest {
            return Ok(());
        }
        if self.clock.now() < activation {
            info!(
                "Waiting until {} to turn on lights for first reservation",
                activation.format("%H:%M")
            );
            self.wait(activation).await?;
        }

        self.apply(DesiredZoneState::ALL_ON).await?;
        info!("Lights turned on for weekday early morning activation");
        self.poll(earliest).await?;
        info!("Weekday morning period ended. Processing reservations.");
        Ok(())
    }

    #[instrument(skip(self, timeline))]
    async fn reservation_sweep(&mut self, today: NaiveDate, timeline: &Timeline) -> Step {
        let blackout = Window {
            start: today.and_time(self.windows.blackout_start),
            end: today.and_time(self.windows.blackout_end),
        };
        let all_on = Window {
            start: today.and_time(self.windows.all_on_start),
            end: today.and_time(self.windows.all_on_end),
        };

        for interval in timeline {
            self.check_shutdown()?;

            let start = today.and_time(interval.start);
            let label = interval.start.format("%H:%M");
            let mut now = self.clock.now();

            if now > start + Duration::minutes(SKIP_AFTER_MINUTES) {
                info!("Skipping reservation at {} as it's passed", label);
                continue;
            }

            loop {
                if blackout.contains(now) {
                    info!(
                        "Within the off period ({} - {}). Turning off all lights.",
                        blackout.start.format("%H:%M"),
                        blackout.end.format("%H:%M")
                    );
                    self.apply(DesiredZoneState::ALL_OFF).await?;
                    self.poll(blackout.end).await?;
                    info!("Off period ended. Resuming reservation processing.");
                    now = self.clock.now();
                }

                if all_on.contains(now) {
                    info!(
                        "Within the all-on period ({} - {}). Turning on all lights.",
                        all_on.start.format("%H:%M"),
                        all_on.end.format("%H:%M")
                    );
                    self.apply(DesiredZoneState::ALL_ON).await?;
                    self.poll(all_on.end).await?;
                    now = self.clock.now();
                }

                if start > now {
                    self.apply(DesiredZoneState::ALL_OFF).await?;
                    now = self.clock.now();
                    let wake_for_all_on = now < all_on.start && all_on.start < start;
                    let next = if wake_for_all_on { all_on.start } else { start };
                    info!(
                        "Waiting until {} for next reservation at {}",
                        next.format("%H:%M"),
                        label
                    );
                    self.poll(next).await?;
                    now = self.clock.now();
                    if wake_for_all_on {
                        continue;
                    }
                }
                break;
            }

            let courts: Vec<&str> = interval.courts.iter().map(String::as_str).collect();
            self.apply(interval.desired_state()).await?;
            info!("Reservation started at {} for {}", label, courts.join(", "));

            self.poll(start + Duration::minutes(SLOT_MINUTES)).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn wind_down(&mut self) -> Step {
        self.check_shutdown()?;
        info!("All reservations processed. Keeping some lights on for additional time.");

        self.apply(DesiredZoneState::ALL_ON).await?;
        let hold = self.clock.now() + to_chrono(self.windows.wind_down_all_on());
        self.poll(hold).await?;

        self.apply(DesiredZoneState::new(true, false, false)).await?;
        let hold = self.clock.now() + to_chrono(self.windows.wind_down_full_only());
        self.poll(hold).await?;

        self.apply(DesiredZoneState::ALL_OFF).await?;
        info!("All lights turned OFF after additional time");
        Ok(())
    }

    /// Dispatches `desired` unless shutdown was requested first
    async fn apply(&mut self, desired: DesiredZoneState) -> Step {
        self.check_shutdown()?;
        apply_desired_state(self.devices, desired, &self.clock, &self.timing).await;
        Ok(())
    }

    /// Single sleep to `target`; used only where nothing needs to preempt
    /// faster than shutdown itself
    async fn wait(&self, target: NaiveDateTime) -> Step {
        match wait_until(&self.clock, target, &self.shutdown).await {
            Wait::Reached => Ok(()),
            Wait::Interrupted => Err(Interrupted),
        }
    }

    async fn poll(&self, target: NaiveDateTime) -> Step {
        match poll_until(&self.clock, target, self.timing.poll(), &self.shutdown).await {
            Wait::Reached => Ok(()),
            Wait::Interrupted => Err(Interrupted),
        }
    }

    fn check_shutdown(&self) -> Step {
        if self.shutdown.is_cancelled() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::ZoneDevice;
    use crate::reservation::ReservationInterval;
    use crate::simulated::SimulatedZone;
    use crate::zone::{Zone, FULL_COURT, HALF_COURT_A, HALF_COURT_B};
    use async_trait::async_trait;
    use chrono::NaiveTime;

    // 2024-09-02 is a Monday, 2024-09-07 a Saturday
    const MONDAY: (i32, u32, u32) = (2024, 9, 2);
    const SATURDAY: (i32, u32, u32) = (2024, 9, 7);

    fn at(day: (i32, u32, u32), h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(day.0, day.1, day.2)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn slot(h: u32, m: u32, courts: &[&str]) -> ReservationInterval {
        ReservationInterval {
            start: NaiveTime::from_hms_opt(h, m, 0).unwrap(),
            courts: courts.iter().map(|c| c.to_string()).collect(),
        }
    }

    struct Rig {
        clock: ManualClock,
        lights: [SimulatedZone; 3],
        devices: ZoneDevices,
        shutdown: CancellationToken,
    }

    impl Rig {
        fn new(start: NaiveDateTime) -> Self {
            let clock = ManualClock::new(start);
            let lights = Zone::ALL.map(|zone| SimulatedZone::new(zone).with_clock(clock.clone()));
            let devices = ZoneDevices::new(
                Box::new(lights[0].clone()),
                Box::new(lights[1].clone()),
                Box::new(lights[2].clone()),
            );
            Self {
                clock,
                lights,
                devices,
                shutdown: CancellationToken::new(),
            }
        }

        async fn run(&mut self, timeline: Vec<ReservationInterval>) -> Result<RunOutcome> {
            let mut orchestrator = DailyOrchestrator::new(
                &mut self.devices,
                self.clock.clone(),
                TimingSettings::default(),
                WindowSettings::default(),
                self.shutdown.clone(),
            );
            orchestrator.run(&Timeline::new(timeline)).await
        }

        /// (time, on) of every command one zone received
        fn history(&self, zone: Zone) -> Vec<(NaiveDateTime, bool)> {
            let index = Zone::ALL.iter().position(|z| *z == zone).unwrap();
            self.lights[index]
                .commands()
                .into_iter()
                .map(|c| (c.at.unwrap(), c.on))
                .collect()
        }
    }

    #[tokio::test]
    async fn weekday_evening_slot_pre_activates_holds_and_winds_down() {
        let day = MONDAY;
        let mut rig = Rig::new(at(day, 19, 0, 0));
        let outcome = rig.run(vec![slot(20, 30, &[FULL_COURT])]).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(
            rig.history(Zone::Full),
            vec![
                (at(day, 20, 15, 0), true),  // 15 minutes early
                (at(day, 20, 30, 0), true),  // reservation
                (at(day, 21, 30, 0), true),  // wind-down: all on
                (at(day, 21, 36, 0), true),  // full fixture alone
                (at(day, 21, 47, 0), false), // everything off
            ]
        );
        assert_eq!(
            rig.history(Zone::HalfA),
            vec![
                (at(day, 20, 15, 20), true),
                (at(day, 20, 30, 20), true),
                (at(day, 21, 30, 20), true),
                (at(day, 21, 36, 20), false),
                (at(day, 21, 47, 20), false),
            ]
        );
        assert!(rig.lights.iter().all(|light| !light.is_on()));
    }

    #[tokio::test]
    async fn daytime_slot_is_overridden_by_blackout_and_all_on_windows() {
        let day = MONDAY;
        let mut rig = Rig::new(at(day, 9, 0, 0));
        rig.run(vec![slot(9, 30, &[FULL_COURT])]).await.unwrap();

        assert_eq!(
            rig.history(Zone::Full),
            vec![
                (at(day, 9, 15, 0), true),   // pre-activation
                (at(day, 9, 30, 0), false),  // blackout
                (at(day, 17, 30, 0), true),  // all-on window
                (at(day, 18, 30, 0), true),  // slot state, already elapsed
                (at(day, 18, 31, 0), true),  // wind-down
                (at(day, 18, 37, 0), true),
                (at(day, 18, 48, 0), false),
            ]
        );
    }

    #[tokio::test]
    async fn weekend_morning_window_then_regular_sweep() {
        let day = SATURDAY;
        let mut rig = Rig::new(at(day, 3, 0, 0));
        rig.run(vec![slot(6, 30, &[HALF_COURT_A])]).await.unwrap();

        assert_eq!(
            rig.history(Zone::Full),
            vec![
                (at(day, 4, 30, 0), true),  // weekend pre-activation
                (at(day, 5, 30, 0), false), // off until the slot
                (at(day, 6, 30, 0), true),  // Half Court A lights the full fixture
                (at(day, 7, 30, 0), true),
                (at(day, 7, 36, 0), true),
                (at(day, 7, 47, 0), false),
            ]
        );
        let half_b: Vec<bool> = rig.history(Zone::HalfB).iter().map(|(_, on)| *on).collect();
        assert_eq!(half_b, vec![true, false, false, true, false, false]);
    }

    #[tokio::test]
    async fn weekend_skips_weekday_pre_activation() {
        let day = SATURDAY;
        let mut rig = Rig::new(at(day, 9, 0, 0));
        rig.run(vec![slot(20, 30, &[HALF_COURT_B])]).await.unwrap();

        let full = rig.history(Zone::Full);
        assert!(!full.contains(&(at(day, 20, 15, 0), true)));
        // blackout first, since 09:00 is inside it
        assert_eq!(full[0], (at(day, 9, 0, 0), false));
    }

    #[tokio::test]
    async fn early_wake_lets_the_all_on_window_run() {
        let day = SATURDAY;
        let mut rig = Rig::new(at(day, 6, 0, 0));
        rig.run(vec![slot(19, 30, &[FULL_COURT])]).await.unwrap();

        assert_eq!(
            rig.history(Zone::Full),
            vec![
                (at(day, 6, 0, 0), false),
                (at(day, 17, 30, 0), true),
                (at(day, 18, 30, 0), false),
                (at(day, 19, 30, 0), true),
                (at(day, 20, 30, 0), true),
                (at(day, 20, 36, 0), true),
                (at(day, 20, 47, 0), false),
            ]
        );
    }

    #[tokio::test]
    async fn elapsed_reservation_is_never_commanded() {
        let day = MONDAY;
        let mut rig = Rig::new(at(day, 19, 45, 0));
        rig.run(vec![slot(18, 30, &[HALF_COURT_A]), slot(20, 30, &[HALF_COURT_B])])
            .await
            .unwrap();

        let half_a = rig.history(Zone::HalfA);
        assert_eq!(half_a[0], (at(day, 19, 45, 20), false));
        assert_eq!(half_a[1], (at(day, 20, 30, 20), false));
        let half_b = rig.history(Zone::HalfB);
        assert_eq!(half_b[1], (at(day, 20, 30, 40), true));
    }

    // A slot is only skipped once more than 59 minutes have passed, even
    // though it ends at 60; in the last minute it is still applied.
    #[tokio::test]
    async fn skip_boundary_at_fifty_nine_minutes() {
        let day = MONDAY;
        let mut rig = Rig::new(at(day, 20, 59, 0));
        rig.run(vec![slot(20, 0, &[HALF_COURT_A])]).await.unwrap();
        assert_eq!(rig.history(Zone::HalfA)[0], (at(day, 20, 59, 20), true));

        let mut rig = Rig::new(at(day, 20, 59, 30));
        rig.run(vec![slot(20, 0, &[HALF_COURT_A])]).await.unwrap();
        // only the wind-down touches the lights
        assert_eq!(rig.history(Zone::HalfA)[0], (at(day, 20, 59, 50), true));
        assert_eq!(rig.history(Zone::HalfA).len(), 3);
    }

    #[tokio::test]
    async fn consecutive_slots_switch_at_each_boundary() {
        let day = MONDAY;
        let mut rig = Rig::new(at(day, 19, 30, 0));
        rig.run(vec![
            slot(19, 30, &[HALF_COURT_A, HALF_COURT_B]),
            slot(20, 30, &[HALF_COURT_B]),
        ])
        .await
        .unwrap();

        let half_a = rig.history(Zone::HalfA);
        assert_eq!(half_a[0], (at(day, 19, 30, 20), true));
        assert_eq!(half_a[1], (at(day, 20, 30, 20), false));
    }

    #[tokio::test]
    async fn empty_timeline_touches_nothing() {
        let mut rig = Rig::new(at(MONDAY, 5, 0, 0));
        let err = rig.run(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::EmptySchedule));
        assert!(rig.lights.iter().all(|light| light.commands().is_empty()));
        assert_eq!(rig.clock.now(), at(MONDAY, 5, 0, 0));
    }

    #[tokio::test]
    async fn shutdown_before_start_stops_without_commands() {
        let mut rig = Rig::new(at(MONDAY, 5, 0, 0));
        rig.shutdown.cancel();
        let outcome = rig.run(vec![slot(6, 30, &[FULL_COURT])]).await.unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(rig.lights.iter().all(|light| light.commands().is_empty()));
    }

    #[tokio::test]
    async fn start_inside_lead_window_turns_everything_on_at_once() {
        let day = MONDAY;
        let mut rig = Rig::new(at(day, 20, 20, 0));
        rig.run(vec![slot(20, 30, &[HALF_COURT_A])]).await.unwrap();

        let half_b = rig.history(Zone::HalfB);
        assert_eq!(half_b[0], (at(day, 20, 20, 40), true));
        // the slot itself leaves Half Court B dark
        assert_eq!(half_b[1], (at(day, 20, 30, 40), false));
    }

    #[tokio::test]
    async fn shutdown_inside_weekday_lead_window_sends_nothing() {
        let mut rig = Rig::new(at(MONDAY, 20, 20, 0));
        rig.shutdown.cancel();
        let outcome = rig.run(vec![slot(20, 30, &[FULL_COURT])]).await.unwrap();

        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(rig.lights.iter().all(|light| light.commands().is_empty()));
        assert_eq!(rig.clock.now(), at(MONDAY, 20, 20, 0));
    }

    #[tokio::test]
    async fn shutdown_inside_weekend_window_sends_nothing() {
        let mut rig = Rig::new(at(SATURDAY, 5, 0, 0));
        rig.shutdown.cancel();
        let outcome = rig.run(vec![slot(20, 30, &[FULL_COURT])]).await.unwrap();

        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(rig.lights.iter().all(|light| light.commands().is_empty()));
        assert_eq!(rig.clock.now(), at(SATURDAY, 5, 0, 0));
    }

    /// Requests shutdown as soon as it receives its first command
    struct TripWire {
        inner: SimulatedZone,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl ZoneDevice for TripWire {
        async fn set_state(&mut self, on: bool) -> Result<()> {
            self.shutdown.cancel();
            self.inner.set_state(on).await
        }

        async fn status(&mut self) -> Result<Option<bool>> {
            self.inner.status().await
        }
    }

    #[tokio::test]
    async fn in_flight_apply_completes_before_shutdown() {
        let day = MONDAY;
        let mut rig = Rig::new(at(day, 19, 0, 0));
        let trip = TripWire {
            inner: rig.lights[0].clone(),
            shutdown: rig.shutdown.clone(),
        };
        rig.devices = ZoneDevices::new(
            Box::new(trip),
            Box::new(rig.lights[1].clone()),
            Box::new(rig.lights[2].clone()),
        );

        let outcome = rig.run(vec![slot(20, 30, &[FULL_COURT])]).await.unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        // the pre-activation apply reached every zone, nothing after it did
        for light in &rig.lights {
            assert_eq!(light.commands().len(), 1);
        }
        assert_eq!(rig.clock.now(), at(day, 20, 16, 0));
    }

    #[tokio::test]
    async fn flaky_zone_does_not_stall_the_day() {
        let day = MONDAY;
        let mut rig = Rig::new(at(day, 19, 0, 0));
        rig.lights[2].fail_next_commands(100);
        let outcome = rig.run(vec![slot(20, 30, &[FULL_COURT])]).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        // two attempts per apply, five applies
        assert_eq!(rig.lights[2].commands().len(), 10);
        assert!(!rig.lights[0].is_on());
    }
}
