/*!
 # Zone devices

 Each zone is driven by one [`ZoneDevice`]: something that takes an on/off
 command and can report the state it is in. The concrete transport is chosen
 by configuration; the orchestrator only sees the trait.
*/

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument};

use crate::ble::BleZone;
use crate::config::{DeviceSettings, Transport};
use crate::simulated::SimulatedZone;
use crate::zone::Zone;
use crate::{Error, Result};

/// A controllable light for one zone
#[async_trait]
pub trait ZoneDevice: Send + Sync {
    /// Commands the light on or off
    async fn set_state(&mut self, on: bool) -> Result<()>;

    /// Reports the power state, `None` when the device cannot tell
    async fn status(&mut self) -> Result<Option<bool>>;
}

/// One device per zone, owned by a single daily run
pub struct ZoneDevices {
    full: Box<dyn ZoneDevice>,
    half_a: Box<dyn ZoneDevice>,
    half_b: Box<dyn ZoneDevice>,
}

impl ZoneDevices {
    pub fn new(
        full: Box<dyn ZoneDevice>,
        half_a: Box<dyn ZoneDevice>,
        half_b: Box<dyn ZoneDevice>,
    ) -> Self {
        Self {
            full,
            half_a,
            half_b,
        }
    }

    /// Device driving `zone`
    pub fn get_mut(&mut self, zone: Zone) -> &mut dyn ZoneDevice {
        match zone {
            Zone::Full => self.full.as_mut(),
            Zone::HalfA => self.half_a.as_mut(),
            Zone::HalfB => self.half_b.as_mut(),
        }
    }

    /// Every zone with its device, in command order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Zone, &mut Box<dyn ZoneDevice>)> + '_ {
        [
            (Zone::Full, &mut self.full),
            (Zone::HalfA, &mut self.half_a),
            (Zone::HalfB, &mut self.half_b),
        ]
        .into_iter()
    }
}

/// Sets up one device per zone for the configured transport
#[instrument(skip(settings), fields(transport = ?settings.transport))]
pub async fn connect(settings: &DeviceSettings) -> Result<ZoneDevices> {
    match settings.transport {
        Transport::Simulated => {
            info!("Using simulated zone devices");
            Ok(ZoneDevices::new(
                Box::new(SimulatedZone::new(Zone::Full)),
                Box::new(SimulatedZone::new(Zone::HalfA)),
                Box::new(SimulatedZone::new(Zone::HalfB)),
            ))
        }
        Transport::Ble => {
            let scan = Duration::from_secs(settings.scan_secs);
            let mut devices = Vec::with_capacity(Zone::ALL.len());
            for zone in Zone::ALL {
                let addr = ble_address(settings, zone)?;
                info!("Connecting {} to {}", zone, addr);
                let device = BleZone::connect(zone, addr, scan).await.map_err(|e| {
                    Error::DeviceSetup(format!("{zone} ({addr}): {e}"))
                })?;
                devices.push(Box::new(device) as Box<dyn ZoneDevice>);
            }
            let mut devices = devices.into_iter();
            match (devices.next(), devices.next(), devices.next()) {
                (Some(full), Some(half_a), Some(half_b)) => {
                    Ok(ZoneDevices::new(full, half_a, half_b))
                }
                _ => Err(Error::DeviceSetup("incomplete zone set".into())),
            }
        }
    }
}

fn ble_address(settings: &DeviceSettings, zone: Zone) -> Result<&str> {
    let addr = match zone {
        Zone::Full => settings.full.as_deref(),
        Zone::HalfA => settings.half_a.as_deref(),
        Zone::HalfB => settings.half_b.as_deref(),
    };
    addr.ok_or_else(|| Error::DeviceSetup(format!("no address configured for {zone}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_transport_builds_all_zones() {
        let mut devices = connect(&DeviceSettings::default()).await.unwrap();
        for zone in Zone::ALL {
            let device = devices.get_mut(zone);
            device.set_state(true).await.unwrap();
            assert_eq!(device.status().await.unwrap(), Some(true));
        }
    }

    #[tokio::test]
    async fn iteration_follows_command_order() {
        let mut devices = connect(&DeviceSettings::default()).await.unwrap();
        let zones: Vec<Zone> = devices.iter_mut().map(|(zone, _)| zone).collect();
        assert_eq!(zones, Zone::ALL.to_vec());
    }

    #[test]
    fn missing_ble_address_is_a_setup_error() {
        let settings = DeviceSettings {
            transport: Transport::Ble,
            ..DeviceSettings::default()
        };
        assert!(matches!(
            ble_address(&settings, Zone::HalfB),
            Err(Error::DeviceSetup(_))
        ));
    }
}
