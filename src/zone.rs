/*!
 # Lighting zones

 The court has three independently switched circuits. The full-court fixture
 also illuminates both halves, so it is on whenever any zone is required.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Court name used by the reservation source for the whole court
pub const FULL_COURT: &str = "Full Court";
/// Court name used by the reservation source for the first half court
pub const HALF_COURT_A: &str = "Half Court A";
/// Court name used by the reservation source for the second half court
pub const HALF_COURT_B: &str = "Half Court B";

/// One independently controllable lighting circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    /// Fixture covering the whole court
    Full,
    /// Fixture over half court A
    HalfA,
    /// Fixture over half court B
    HalfB,
}

impl Zone {
    /// Zones in command order: the full fixture first, then the finer overrides
    pub const ALL: [Zone; 3] = [Zone::Full, Zone::HalfA, Zone::HalfB];

    /// Name of the court this zone lights, as it appears in the timetable
    pub fn court_name(self) -> &'static str {
        match self {
            Zone::Full => FULL_COURT,
            Zone::HalfA => HALF_COURT_A,
            Zone::HalfB => HALF_COURT_B,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.court_name())
    }
}

/// Required on/off state of every zone at one decision point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredZoneState {
    pub full: bool,
    pub half_a: bool,
    pub half_b: bool,
}

impl DesiredZoneState {
    /// Every zone on
    pub const ALL_ON: Self = Self {
        full: true,
        half_a: true,
        half_b: true,
    };

    /// Every zone off
    pub const ALL_OFF: Self = Self {
        full: false,
        half_a: false,
        half_b: false,
    };

    /// Builds a state from the requested halves and full court, lighting the
    /// full fixture whenever anything is requested
    pub fn new(full: bool, half_a: bool, half_b: bool) -> Self {
        Self {
            full: full || half_a || half_b,
            half_a,
            half_b,
        }
    }

    /// Desired state of one zone
    pub fn get(&self, zone: Zone) -> bool {
        match zone {
            Zone::Full => self.full,
            Zone::HalfA => self.half_a,
            Zone::HalfB => self.half_b,
        }
    }

    /// Zone/state pairs in command order
    pub fn zones(&self) -> impl Iterator<Item = (Zone, bool)> + '_ {
        Zone::ALL.into_iter().map(move |zone| (zone, self.get(zone)))
    }
}

impl fmt::Display for DesiredZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = |on: bool| if on { "on" } else { "off" };
        write!(
            f,
            "full={} half_a={} half_b={}",
            word(self.full),
            word(self.half_a),
            word(self.half_b)
        )
    }
}

/// Maps the courts booked in a slot to the state each zone must be in.
/// Unknown court names light nothing.
pub fn resolve(courts: &BTreeSet<String>) -> DesiredZoneState {
    let full = courts.contains(FULL_COURT);
    let half_a = full || courts.contains(HALF_COURT_A);
    let half_b = full || courts.contains(HALF_COURT_B);
    DesiredZoneState::new(full, half_a, half_b)
}
