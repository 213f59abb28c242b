/*!
 # Configuration

 Defaults, overlaid by a TOML file, overlaid by `COURT_` environment
 variables (nested keys separated by `__`, e.g. `COURT_SOURCE__URL`).
*/

use chrono::{Duration as ChronoDuration, NaiveTime};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Config file read when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "courtd.toml";

/// Upper bound for any configured span in minutes
const MINUTES_PER_DAY: i64 = 24 * 60;
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Top-level configuration shared by `courtd` and `courtctl`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub devices: DeviceSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub windows: WindowSettings,
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default)]
    pub dashboard: DashboardSettings,
    #[serde(default)]
    pub mock: MockSettings,
}

/// Where and how the reservation timetable is fetched
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SourceSettings {
    pub url: String,
    /// Fetch attempts per check
    pub attempts: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5000/reservations".into(),
            attempts: 2,
            retry_delay_secs: 300,
            timeout_secs: 30,
            user_agent: concat!("court-lights/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl SourceSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Zone device transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// In-memory lights, for development and tests
    #[default]
    Simulated,
    /// Bluetooth LE light controllers
    Ble,
}

/// Which devices drive which zone
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceSettings {
    pub transport: Transport,
    /// BLE address or peripheral id of the full-court controller
    pub full: Option<String>,
    /// BLE address or peripheral id of the half court A controller
    pub half_a: Option<String>,
    /// BLE address or peripheral id of the half court B controller
    pub half_b: Option<String>,
    /// How long to scan for each BLE controller
    pub scan_secs: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            transport: Transport::Simulated,
            full: None,
            half_a: None,
            half_b: None,
            scan_secs: 10,
        }
    }
}

/// Pacing of device commands and waits
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimingSettings {
    /// Delay between a command and reading back the zone state
    pub settle_secs: u64,
    /// Delay after a confirmation before the next zone is touched
    pub pace_secs: u64,
    /// Granularity of cancellable waits
    pub poll_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            settle_secs: 10,
            pace_secs: 10,
            poll_secs: 60,
        }
    }
}

impl TimingSettings {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn pace(&self) -> Duration {
        Duration::from_secs(self.pace_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }
}

/// Fixed daily windows that override reservations
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WindowSettings {
    /// Weekend pre-activation start
    #[serde(with = "hhmm")]
    pub weekend_on: NaiveTime,
    /// Weekend pre-activation end
    #[serde(with = "hhmm")]
    pub weekend_off: NaiveTime,
    /// Minutes before the first weekday reservation that lights come on
    pub weekday_lead_minutes: i64,
    #[serde(with = "hhmm")]
    pub blackout_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub blackout_end: NaiveTime,
    #[serde(with = "hhmm")]
    pub all_on_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub all_on_end: NaiveTime,
    /// Minutes everything stays on after the last reservation
    pub wind_down_all_on_minutes: i64,
    /// Minutes the full fixture stays on alone before everything goes off
    pub wind_down_full_only_minutes: i64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            weekend_on: hm(4, 30),
            weekend_off: hm(5, 30),
            weekday_lead_minutes: 15,
            blackout_start: hm(7, 30),
            blackout_end: hm(17, 30),
            all_on_start: hm(17, 30),
            all_on_end: hm(18, 30),
            wind_down_all_on_minutes: 5,
            wind_down_full_only_minutes: 10,
        }
    }
}

impl WindowSettings {
    pub fn weekday_lead(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.weekday_lead_minutes.clamp(0, MINUTES_PER_DAY))
    }

    pub fn wind_down_all_on(&self) -> Duration {
        minutes(self.wind_down_all_on_minutes)
    }

    pub fn wind_down_full_only(&self) -> Duration {
        minutes(self.wind_down_full_only_minutes)
    }
}

/// When the daily run starts and when the timetable is re-checked
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WatcherSettings {
    #[serde(with = "hhmm")]
    pub daily_start: NaiveTime,
    #[serde(with = "hhmm_list")]
    pub checks: Vec<NaiveTime>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            daily_start: hm(4, 10),
            checks: vec![
                hm(5, 20),
                hm(6, 20),
                hm(18, 20),
                hm(19, 20),
                hm(20, 20),
                hm(21, 20),
            ],
        }
    }
}

/// Operator dashboard
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DashboardSettings {
    pub bind: String,
    /// Log lines kept for the tail view
    pub log_lines: usize,
    /// Daemon executable; defaults to `courtd` next to the running binary
    pub command: Option<PathBuf>,
    /// Extra arguments passed to the daemon
    #[serde(default)]
    pub args: Vec<String>,
    /// Seconds the daemon gets to exit after SIGTERM before it is killed
    pub stop_grace_secs: u64,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5001".into(),
            log_lines: 1000,
            command: None,
            args: Vec::new(),
            stop_grace_secs: 10,
        }
    }
}

impl DashboardSettings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Mock reservation server
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MockSettings {
    pub bind: String,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".into(),
        }
    }
}

impl Config {
    /// Loads defaults, then the TOML file, then `COURT_` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        debug!("Loading configuration from {}", path.display());

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("COURT_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.source.attempts == 0 {
            return Err(invalid("source.attempts must be at least 1"));
        }
        if self.timing.poll_secs == 0 {
            return Err(invalid("timing.poll_secs must be at least 1"));
        }
        let w = &self.windows;
        if w.weekend_on >= w.weekend_off {
            return Err(invalid("windows.weekend_on must be before weekend_off"));
        }
        if w.blackout_start >= w.blackout_end {
            return Err(invalid("windows.blackout_start must be before blackout_end"));
        }
        if w.all_on_start >= w.all_on_end {
            return Err(invalid("windows.all_on_start must be before all_on_end"));
        }
        let durations = [
            w.weekday_lead_minutes,
            w.wind_down_all_on_minutes,
            w.wind_down_full_only_minutes,
        ];
        if durations.iter().any(|m| !(0..=MINUTES_PER_DAY).contains(m)) {
            return Err(invalid("window durations must be between 0 and 1440 minutes"));
        }
        if self.source.retry_delay_secs > SECONDS_PER_DAY {
            return Err(invalid("source.retry_delay_secs must be at most one day"));
        }
        if self.devices.transport == Transport::Ble
            && (self.devices.full.is_none()
                || self.devices.half_a.is_none()
                || self.devices.half_b.is_none())
        {
            return Err(invalid("ble transport needs full, half_a and half_b addresses"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> Error {
    Error::Config(reason.to_string())
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

fn minutes(count: i64) -> Duration {
    Duration::from_secs(u64::try_from(count).unwrap_or(0).saturating_mul(60))
}

/// `"HH:MM"` (de)serialization for times of day
mod hhmm {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }

    pub(super) fn parse(raw: &str) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .map_err(|e| format!("invalid time of day {raw:?}: {e}"))
    }
}

mod hhmm_list {
    use chrono::NaiveTime;
    use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        times: &[NaiveTime],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(times.len()))?;
        for time in times {
            seq.serialize_element(&time.format("%H:%M").to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<NaiveTime>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|raw| super::hhmm::parse(raw).map_err(de::Error::custom))
            .collect()
    }
}
