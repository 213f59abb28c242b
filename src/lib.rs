/*!
 # Court Lighting Controller Library

 Drives the lighting zones of a shared court from the day's reservation
 timetable. The timetable is fetched over HTTP, normalized into a sorted
 timeline, and walked by a daily orchestrator that switches the Full Court,
 Half Court A and Half Court B zones on and off around reservations and a few
 fixed daily windows.

 ## Features

 * Reservation timetable fetching and normalization
 * Per-zone confirm-and-retry device control
 * Weekend and weekday pre-activation, daytime blackout and evening all-on windows
 * End-of-day wind-down
 * Schedule watching with restart on change
 * Bluetooth LE and simulated zone transports

 ## Example

 ```rust,no_run
 use court_lights::*;
 use tokio_util::sync::CancellationToken;

 #[tokio::main]
 async fn main() -> Result<()> {
     tracing_subscriber::fmt::init();

     let config = Config::load(None)?;
     let source = HttpReservationSource::new(&config.source)?;
     let timeline = source.fetch_timeline().await?;

     let mut devices = device::connect(&config.devices).await?;
     let mut orchestrator = DailyOrchestrator::new(
         &mut devices,
         SystemClock,
         config.timing.clone(),
         config.windows.clone(),
         CancellationToken::new(),
     );
     orchestrator.run(&timeline).await?;
     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the court lighting controller
#[derive(Error, Debug)]
pub enum Error {
    /// The reservation source could not be reached or returned garbage
    #[error("Failed to fetch reservations: {0}")]
    Fetch(String),

    /// A timetable entry did not carry a parseable time of day
    #[error("Malformed schedule entry: {entry:?}")]
    MalformedSchedule { entry: String },

    /// The day's timetable has no reservations
    #[error("Schedule contains no reservations")]
    EmptySchedule,

    /// A zone rejected or failed to transmit a power command
    #[error("Command to {zone} failed: {reason}")]
    DeviceCommand { zone: Zone, reason: String },

    /// A zone could not report its state
    #[error("Could not read state of {zone}: {reason}")]
    DeviceConfirm { zone: Zone, reason: String },

    /// Zone devices could not be set up for the run
    #[error("Device setup failed: {0}")]
    DeviceSetup(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No Bluetooth adapters found
    #[error("No Bluetooth adapters found")]
    NoBluetoothAdapters,

    /// No compatible LED device found
    #[error("No compatible LED device found at {0}")]
    NoCompatibleDevice(String),

    /// Failed to find required BLE characteristic
    #[error("Could not find required BLE characteristic: {0}")]
    CharacteristicNotFound(String),

    /// BLE communication error
    #[error("BLE communication error: {0}")]
    BleError(String),

    /// Error from btleplug
    #[error(transparent)]
    BtlePlugError(#[from] btleplug::Error),

    /// I/O errors from the dashboard and its child process
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch(err.to_string())
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod ble;
pub mod clock;
pub mod config;
pub mod control;
pub mod dashboard;
pub mod device;
pub mod mock;
pub mod orchestrator;
pub mod reservation;
pub mod simulated;
pub mod source;
pub mod supervisor;
pub mod watcher;
pub mod zone;

// Re-export key types
pub use clock::{Clock, ManualClock, SystemClock, Wait};
pub use config::Config;
pub use control::{apply_desired_state, apply_state, Outcome};
pub use device::{ZoneDevice, ZoneDevices};
pub use orchestrator::{DailyOrchestrator, RunOutcome};
pub use reservation::{normalize, ReservationInterval, Timeline};
pub use simulated::SimulatedZone;
pub use source::{HttpReservationSource, ReservationSource};
pub use supervisor::{RunGuard, RunState, Supervisor};
pub use watcher::{CheckResult, ScheduleWatcher};
pub use zone::{resolve, DesiredZoneState, Zone};
