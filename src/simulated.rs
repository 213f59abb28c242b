/*!
 # Simulated zone lights

 In-memory stand-ins for the real controllers. They are what `courtd` drives
 when no hardware is configured, and what the tests script to misbehave.
*/

use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::{Clock, ManualClock};
use crate::device::ZoneDevice;
use crate::zone::Zone;
use crate::{Error, Result};

/// One command received by a simulated light
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub zone: Zone,
    pub on: bool,
    /// Clock time of the command when a clock is attached
    pub at: Option<NaiveDateTime>,
}

#[derive(Debug, Default)]
struct SimState {
    on: bool,
    fail_commands: u32,
    ignore_commands: u32,
    unknown_reads: u32,
    commands: Vec<CommandRecord>,
    reads: u32,
}

/// An in-memory light; clones share the same light
#[derive(Debug, Clone)]
pub struct SimulatedZone {
    zone: Zone,
    clock: Option<ManualClock>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedZone {
    pub fn new(zone: Zone) -> Self {
        Self {
            zone,
            clock: None,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Stamps every received command with the clock's time
    pub fn with_clock(mut self, clock: ManualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// The next `count` commands fail outright
    pub fn fail_next_commands(&self, count: u32) {
        self.state.lock().fail_commands += count;
    }

    /// The next `count` commands are acknowledged but do nothing
    pub fn ignore_next_commands(&self, count: u32) {
        self.state.lock().ignore_commands += count;
    }

    /// The next `count` status reads cannot tell the state
    pub fn report_unknown_next(&self, count: u32) {
        self.state.lock().unknown_reads += count;
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().on
    }

    /// Every command received so far, failed ones included
    pub fn commands(&self) -> Vec<CommandRecord> {
        self.state.lock().commands.clone()
    }

    /// Number of status reads so far
    pub fn reads(&self) -> u32 {
        self.state.lock().reads
    }
}

#[async_trait]
impl ZoneDevice for SimulatedZone {
    async fn set_state(&mut self, on: bool) -> Result<()> {
        let at = self.clock.as_ref().map(|clock| clock.now());
        let mut state = self.state.lock();
        state.commands.push(CommandRecord {
            zone: self.zone,
            on,
            at,
        });

        if state.fail_commands > 0 {
            state.fail_commands -= 1;
            warn!("Simulated {} dropped the command", self.zone);
            return Err(Error::DeviceCommand {
                zone: self.zone,
                reason: "simulated transport failure".into(),
            });
        }
        if state.ignore_commands > 0 {
            state.ignore_commands -= 1;
            return Ok(());
        }

        state.on = on;
        info!("{} light turned {}", self.zone, if on { "ON" } else { "OFF" });
        Ok(())
    }

    async fn status(&mut self) -> Result<Option<bool>> {
        let mut state = self.state.lock();
        state.reads += 1;
        if state.unknown_reads > 0 {
            state.unknown_reads -= 1;
            return Ok(None);
        }
        Ok(Some(state.on))
    }
}
