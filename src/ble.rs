/*!
 # Bluetooth LE zone controllers

 Drives ELK-BLEDOM style light controllers, one per zone, addressed by MAC
 address or peripheral id. Only power control is used.
*/

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::device::ZoneDevice;
use crate::zone::Zone;
use crate::{Error, Result};

/// Attempts per BLE write before the command counts as failed
const WRITE_ATTEMPTS: u8 = 3;

/// Gets the default Bluetooth adapter
#[instrument(skip(manager))]
async fn get_central(manager: &Manager) -> Result<Adapter> {
    debug!("Getting default Bluetooth adapter");
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or_else(|| {
        error!("No Bluetooth adapters found");
        Error::NoBluetoothAdapters
    })
}

/// Supported controller families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// ELK-BLE device type
    ElkBle,
    /// LEDBLE device type
    LedBle,
    /// MELK device type
    Melk,
    /// ELK-BULB device type
    ElkBulb,
    /// ELK-LAMPL device type
    ElkLampl,
    /// Unknown device type
    Unknown,
}

impl DeviceType {
    /// Classifies a peripheral by its advertised name
    pub fn from_local_name(name: &str) -> Self {
        if name.starts_with("ELK-BLE") {
            DeviceType::ElkBle
        } else if name.starts_with("LEDBLE") {
            DeviceType::LedBle
        } else if name.starts_with("MELK") {
            DeviceType::Melk
        } else if name.starts_with("ELK-BULB") {
            DeviceType::ElkBulb
        } else if name.starts_with("ELK-LAMPL") {
            DeviceType::ElkLampl
        } else {
            DeviceType::Unknown
        }
    }

    /// Characteristic and power commands for this family
    pub fn config(self) -> DeviceConfig {
        const FFF3: Uuid = Uuid::from_u128(0x0000fff3_0000_1000_8000_00805f9b34fb);
        const FFE1: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);
        const OFF: [u8; 9] = [0x7e, 0x00, 0x04, 0x00, 0x00, 0x00, 0xff, 0x00, 0xef];

        match self {
            DeviceType::ElkBle => DeviceConfig {
                write_uuid: FFF3,
                turn_on_cmd: [0x7e, 0x00, 0x04, 0xf0, 0x00, 0x01, 0xff, 0x00, 0xef],
                turn_off_cmd: OFF,
                command_delay: 15, // 15 seems to be the lowest value supported
            },
            DeviceType::LedBle => DeviceConfig {
                write_uuid: FFE1,
                turn_on_cmd: [0x7e, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0xef],
                turn_off_cmd: OFF,
                command_delay: 15,
            },
            DeviceType::Melk | DeviceType::ElkBulb | DeviceType::ElkLampl | DeviceType::Unknown => {
                DeviceConfig {
                    write_uuid: FFF3,
                    turn_on_cmd: [0x7e, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0xef],
                    turn_off_cmd: OFF,
                    command_delay: 15,
                }
            }
        }
    }
}

/// Per-family protocol details
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// UUID for write characteristic
    pub write_uuid: Uuid,
    /// Command to turn the light on
    pub turn_on_cmd: [u8; 9],
    /// Command to turn the light off
    pub turn_off_cmd: [u8; 9],
    /// Minimum gap between commands in milliseconds
    pub command_delay: u64,
}

/// Serializes commands to one controller and spaces them out
struct CommandQueue {
    semaphore: Semaphore,
    min_delay: Duration,
    last_command: Mutex<std::time::Instant>,
}

impl CommandQueue {
    fn new(min_delay_ms: u64) -> Self {
        let min_delay = Duration::from_millis(min_delay_ms);
        let now = std::time::Instant::now();
        Self {
            semaphore: Semaphore::new(1), // Only allow one command at a time
            min_delay,
            last_command: Mutex::new(now.checked_sub(min_delay).unwrap_or(now)),
        }
    }

    async fn execute<T, F>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T> + Send,
        T: Send,
    {
        // The semaphore is never closed, so a failed acquire only means we run unguarded
        let _permit = self.semaphore.acquire().await.ok();

        let mut last_cmd = self.last_command.lock().await;
        let elapsed = last_cmd.elapsed();
        if elapsed < self.min_delay {
            let wait_time = self.min_delay - elapsed;
            trace!("Rate limiting: waiting {:?} before next command", wait_time);
            time::sleep(wait_time).await;
        }

        let result = future.await;
        *last_cmd = std::time::Instant::now();
        result
    }
}

/// A zone light behind a Bluetooth LE controller
pub struct BleZone {
    zone: Zone,
    peripheral: Peripheral,
    write_characteristic: Characteristic,
    device_type: DeviceType,
    config: DeviceConfig,
    command_queue: Arc<CommandQueue>,
    /// Last power state the controller acknowledged
    acknowledged: Option<bool>,
}

impl BleZone {
    /// Scans for the controller with the given MAC address or id and connects to it
    #[instrument(skip(scan_time))]
    pub async fn connect(zone: Zone, addr: &str, scan_time: Duration) -> Result<BleZone> {
        let manager = Manager::new().await?;
        let central = get_central(&manager).await?;

        info!("Scanning for {} controller {}", zone, addr);
        central.start_scan(ScanFilter::default()).await?;

        let start_time = std::time::Instant::now();
        let mut found: Option<(Peripheral, DeviceType)> = None;

        while found.is_none() && start_time.elapsed() < scan_time {
            for p in central.peripherals().await? {
                let matches = p.address().to_string().eq_ignore_ascii_case(addr)
                    || p.id().to_string().eq_ignore_ascii_case(addr);
                if !matches {
                    continue;
                }
                if let Ok(Some(props)) = p.properties().await {
                    let name = props.local_name.unwrap_or_default();
                    let device_type = DeviceType::from_local_name(&name);
                    if device_type == DeviceType::Unknown {
                        warn!("Controller {} advertises as {:?}, treating as generic", addr, name);
                    } else {
                        debug!("Found {} ({:?})", name, device_type);
                    }
                    found = Some((p, device_type));
                    break;
                }
            }

            if found.is_none() {
                trace!(
                    "Still scanning for {}... ({}s elapsed)",
                    addr,
                    start_time.elapsed().as_secs()
                );
                time::sleep(Duration::from_millis(500)).await;
            }
        }

        central.stop_scan().await?;

        let Some((peripheral, device_type)) = found else {
            error!(
                "No controller {} found within {} seconds",
                addr,
                scan_time.as_secs()
            );
            return Err(Error::NoCompatibleDevice(addr.to_string()));
        };

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        debug!("Discovering services...");
        peripheral.discover_services().await?;

        let config = device_type.config();
        let write_characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == config.write_uuid)
            .ok_or(Error::CharacteristicNotFound(config.write_uuid.to_string()))?;
        debug!("Found write characteristic: {}", write_characteristic.uuid);

        info!("{} connected to {:?} controller {}", zone, device_type, addr);
        Ok(BleZone {
            zone,
            peripheral,
            write_characteristic,
            device_type,
            command_queue: Arc::new(CommandQueue::new(config.command_delay)),
            config,
            acknowledged: None,
        })
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Writes one command, retrying transport errors
    #[instrument(skip(self, command), fields(zone = %self.zone))]
    async fn send_command(&self, command: &[u8]) -> Result<()> {
        let peripheral = &self.peripheral;
        let characteristic = &self.write_characteristic;

        // Prefer WriteWithResponse so a successful write means the controller got it
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.command_queue
            .execute(async move {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match peripheral.write(characteristic, command, write_type).await {
                        Ok(()) => {
                            trace!("Command sent (attempt {}/{})", attempt, WRITE_ATTEMPTS);
                            return Ok(());
                        }
                        Err(e) if attempt < WRITE_ATTEMPTS => {
                            warn!("Write failed (attempt {}/{}): {}", attempt, WRITE_ATTEMPTS, e);
                            time::sleep(Duration::from_millis(300)).await;
                        }
                        Err(e) => {
                            error!("Write failed permanently: {}", e);
                            return Err(Error::BleError(e.to_string()));
                        }
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl ZoneDevice for BleZone {
    async fn set_state(&mut self, on: bool) -> Result<()> {
        let command = if on {
            self.config.turn_on_cmd
        } else {
            self.config.turn_off_cmd
        };

        match self.send_command(&command).await {
            Ok(()) => {
                self.acknowledged = Some(on);
                debug!("{} controller acknowledged power {}", self.zone, on);
                Ok(())
            }
            Err(e) => {
                self.acknowledged = None;
                Err(Error::DeviceCommand {
                    zone: self.zone,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Last power state the controller acknowledged, while still connected.
    ///
    /// These controllers cannot report their power state, so this never reads
    /// the light itself: a zone counts as confirmed once its write was acked
    /// and the link is still up. A dropped link reports `None`.
    async fn status(&mut self) -> Result<Option<bool>> {
        let connected = self
            .peripheral
            .is_connected()
            .await
            .map_err(|e| Error::DeviceConfirm {
                zone: self.zone,
                reason: e.to_string(),
            })?;
        if !connected {
            warn!("{} controller is no longer connected", self.zone);
            self.acknowledged = None;
            return Ok(None);
        }
        Ok(self.acknowledged)
    }
}
