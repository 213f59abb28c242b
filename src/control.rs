/*!
 # Confirm-and-retry zone control

 Every zone command is followed by a read-back after a settle delay. Zones
 that could not be confirmed get exactly one more attempt once the other
 zones have been handled; whatever that attempt yields is final.
*/

use std::fmt;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::TimingSettings;
use crate::device::{ZoneDevice, ZoneDevices};
use crate::zone::{DesiredZoneState, Zone};

/// Result of one command-and-confirm cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The device reported the commanded state
    Confirmed,
    /// The device reported another state, or could not tell
    Unconfirmed,
    /// The command itself failed; nothing was read back
    CommandFailed,
}

/// What happened to one zone during an apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneReport {
    pub zone: Zone,
    pub desired: bool,
    pub first: Outcome,
    /// Outcome of the single retry, if one was needed
    pub retry: Option<Outcome>,
}

impl ZoneReport {
    /// Outcome the zone was left with
    pub fn outcome(&self) -> Outcome {
        self.retry.unwrap_or(self.first)
    }
}

/// Per-zone results of one [`apply_desired_state`] call, in command order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport(pub Vec<ZoneReport>);

impl ApplyReport {
    pub fn all_confirmed(&self) -> bool {
        self.0.iter().all(|r| r.outcome() == Outcome::Confirmed)
    }

    pub fn get(&self, zone: Zone) -> Option<&ZoneReport> {
        self.0.iter().find(|r| r.zone == zone)
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Outcome::Confirmed => "confirmed",
            Outcome::Unconfirmed => "unconfirmed",
            Outcome::CommandFailed => "command failed",
        };
        f.write_str(text)
    }
}

/// Commands one zone, waits `settle`, reads the state back, then waits
/// `pace` so consecutive zones do not flood the network.
///
/// A failed command returns immediately without a read-back.
#[instrument(skip(device, clock, timing))]
pub async fn apply_state<C: Clock + ?Sized>(
    device: &mut dyn ZoneDevice,
    zone: Zone,
    desired: bool,
    clock: &C,
    timing: &TimingSettings,
) -> Outcome {
    let word = on_off(desired);
    if let Err(e) = device.set_state(desired).await {
        error!("Error turning {} {} light: {}", word, zone, e);
        return Outcome::CommandFailed;
    }
    info!("{} light turned {}", zone, word);

    clock.sleep(timing.settle()).await;

    let outcome = match device.status().await {
        Ok(Some(actual)) if actual == desired => {
            info!("{} light confirmed {}", zone, word);
            Outcome::Confirmed
        }
        Ok(Some(actual)) => {
            warn!(
                "{} light is in the wrong state: expected {}, found {}",
                zone,
                word,
                on_off(actual)
            );
            Outcome::Unconfirmed
        }
        Ok(None) => {
            warn!("Unable to confirm {} light state", zone);
            Outcome::Unconfirmed
        }
        Err(e) => {
            error!("Error checking {} light status: {}", zone, e);
            Outcome::Unconfirmed
        }
    };

    clock.sleep(timing.pace()).await;
    outcome
}

/// Applies a full zone state: Full, then Half A, then Half B, then one retry
/// pass over every zone that was not confirmed.
#[instrument(skip(devices, clock, timing), fields(desired = %desired))]
pub async fn apply_desired_state<C: Clock + ?Sized>(
    devices: &mut ZoneDevices,
    desired: DesiredZoneState,
    clock: &C,
    timing: &TimingSettings,
) -> ApplyReport {
    let mut reports = Vec::with_capacity(Zone::ALL.len());

    for (zone, on) in desired.zones() {
        let first = apply_state(devices.get_mut(zone), zone, on, clock, timing).await;
        reports.push(ZoneReport {
            zone,
            desired: on,
            first,
            retry: None,
        });
    }

    for report in reports.iter_mut().filter(|r| r.first != Outcome::Confirmed) {
        let (zone, on) = (report.zone, report.desired);
        info!("Retrying {} light ({})", zone, report.first);
        let retry = apply_state(devices.get_mut(zone), zone, on, clock, timing).await;
        match retry {
            Outcome::Confirmed => {
                info!("Successfully turned {} light {} on retry", zone, on_off(on))
            }
            Outcome::Unconfirmed => {
                error!("Failed to confirm {} light state after retry", zone)
            }
            Outcome::CommandFailed => {
                error!("Failed to turn {} light {} on retry", zone, on_off(on))
            }
        }
        report.retry = Some(retry);
    }

    ApplyReport(reports)
}
