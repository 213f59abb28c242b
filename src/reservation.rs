/*!
 # Reservation timeline

 Turns the raw `time -> courts` mapping published by the reservation source
 into a timeline of one-hour slots sorted by start time.
*/

use chrono::{Duration, NaiveTime};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument, warn};

use crate::zone::{resolve, DesiredZoneState};
use crate::{Error, Result};

/// Length of one booking slot, in minutes
pub const SLOT_MINUTES: i64 = 60;

/// Accepted time-of-day formats: 24 hour, then 12 hour with AM/PM
const TIME_FORMATS: [&str; 2] = ["%H:%M", "%I:%M %p"];

/// One booked slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationInterval {
    /// Time of day the slot starts
    pub start: NaiveTime,
    /// Courts booked in this slot, marker characters stripped
    pub courts: BTreeSet<String>,
}

impl ReservationInterval {
    /// Time of day the slot ends
    pub fn end(&self) -> NaiveTime {
        self.start + Duration::minutes(SLOT_MINUTES)
    }

    /// Zone state needed while this slot is running
    pub fn desired_state(&self) -> DesiredZoneState {
        resolve(&self.courts)
    }
}

/// The day's reservation slots, ascending by start time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Timeline(Vec<ReservationInterval>);

impl Timeline {
    pub fn new(mut intervals: Vec<ReservationInterval>) -> Self {
        intervals.sort_by_key(|interval| interval.start);
        Self(intervals)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Earliest slot of the day
    pub fn first(&self) -> Option<&ReservationInterval> {
        self.0.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ReservationInterval> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Timeline {
    type Item = &'a ReservationInterval;
    type IntoIter = std::slice::Iter<'a, ReservationInterval>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Parses a timetable time string, `HH:MM` or `h:MM AM/PM`
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime> {
    let trimmed = raw.trim();
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| Error::MalformedSchedule {
            entry: raw.to_string(),
        })
}

/// Strips the trailing periods the source uses to mark sub-labels
pub fn clean_court_name(raw: &str) -> String {
    raw.trim_end_matches('.').trim().to_string()
}

/// Normalizes a raw timetable into a sorted timeline.
///
/// Fails on the first time string that does not parse; the caller keeps
/// whatever timeline it had before.
#[instrument(skip(raw), fields(entries = raw.len()))]
pub fn normalize(raw: &BTreeMap<String, Vec<String>>) -> Result<Timeline> {
    let mut intervals = Vec::with_capacity(raw.len());

    for (time, courts) in raw {
        let start = parse_time_of_day(time)?;
        let courts: BTreeSet<String> = courts
            .iter()
            .map(|court| clean_court_name(court))
            .filter(|court| !court.is_empty())
            .collect();

        if courts.is_empty() {
            warn!("Dropping reservation at {} with no courts", time);
            continue;
        }

        debug!("Reservation at {}: {:?}", start.format("%H:%M"), courts);
        intervals.push(ReservationInterval { start, courts });
    }

    Ok(Timeline::new(intervals))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(time, courts)| {
                (
                    time.to_string(),
                    courts.iter().map(|c| c.to_string()).collect(),
                )
            })
            .collect()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn sorts_by_parsed_time_not_by_string() {
        let timeline = normalize(&raw(&[
            ("18:30", &["Full Court"]),
            ("9:30", &["Half Court A"]),
            ("05:30", &["Half Court B"]),
        ]))
        .unwrap();

        let starts: Vec<NaiveTime> = timeline.iter().map(|i| i.start).collect();
        assert_eq!(starts, vec![hm(5, 30), hm(9, 30), hm(18, 30)]);
    }

    #[test]
    fn strips_trailing_markers() {
        let timeline = normalize(&raw(&[("07:30", &["Half Court B.", "Half Court A."])])).unwrap();
        let interval = timeline.first().unwrap();
        assert!(interval.courts.contains("Half Court A"));
        assert!(interval.courts.contains("Half Court B"));
        assert_eq!(interval.courts.len(), 2);
    }

    #[test]
    fn duplicate_court_names_collapse() {
        let timeline = normalize(&raw(&[("20:30", &["Full Court", "Full Court."])])).unwrap();
        assert_eq!(timeline.first().unwrap().courts.len(), 1);
    }

    #[test]
    fn accepts_twelve_hour_times() {
        let timeline = normalize(&raw(&[("6:30 PM", &["Full Court"])])).unwrap();
        assert_eq!(timeline.first().unwrap().start, hm(18, 30));
    }

    #[test]
    fn malformed_time_is_an_error() {
        let err = normalize(&raw(&[("25:99", &["Full Court"])])).unwrap_err();
        assert!(matches!(err, Error::MalformedSchedule { entry } if entry == "25:99"));
    }

    #[test]
    fn empty_court_lists_are_dropped() {
        let timeline = normalize(&raw(&[("06:30", &[]), ("07:30", &["."])])).unwrap();
        assert!(timeline.is_empty());
    }

    #[test]
    fn end_is_one_slot_after_start() {
        let timeline = normalize(&raw(&[("21:30", &["Full Court"])])).unwrap();
        assert_eq!(timeline.first().unwrap().end(), hm(22, 30));
    }

    #[test]
    fn equal_timetables_compare_equal() {
        let a = normalize(&raw(&[("05:30", &["Half Court A."])])).unwrap();
        let b = normalize(&raw(&[("05:30", &["Half Court A"])])).unwrap();
        let c = normalize(&raw(&[("05:30", &["Half Court B"])])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
