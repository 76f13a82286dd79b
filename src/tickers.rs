//! Time-driven background activity the fetch/decode/execute loop must
//! service between instructions: the PIT tick and the device-poll
//! (keyboard + display flush) interval.

use crate::bios::BiosFacade;
use std::time::{Duration, Instant};

/// The BIOS BDA tick counter advances at roughly 18.2 Hz on real hardware
/// (the PIT's default divisor). This emulator drives it off wall-clock time
/// rather than counting emulated CPU cycles, since cycle-accurate timing is
/// out of scope.
const PIT_TICK_INTERVAL: Duration = Duration::from_micros(54_925);

/// How often the device ticker polls the keyboard source and flushes the
/// display sink, expressed as a step count rather than wall-clock time so
/// it scales with however fast the host can retire instructions.
const DEVICE_TICK_STEPS: u64 = 100;

pub struct TickerRegistry {
    last_pit_tick: Instant,
    steps_since_device_tick: u64,
}

impl TickerRegistry {
    pub fn new() -> Self {
        TickerRegistry {
            last_pit_tick: Instant::now(),
            steps_since_device_tick: 0,
        }
    }

    /// Called once per retired instruction. Advances the BDA tick counter
    /// when enough wall-clock time has passed, and polls devices every
    /// `DEVICE_TICK_STEPS` instructions.
    pub fn tick(&mut self, bios: &mut BiosFacade) {
        let now = Instant::now();
        if now.duration_since(self.last_pit_tick) >= PIT_TICK_INTERVAL {
            bios.bda_ticks = bios.bda_ticks.wrapping_add(1);
            self.last_pit_tick = now;
        }

        self.steps_since_device_tick += 1;
        if self.steps_since_device_tick >= DEVICE_TICK_STEPS {
            self.steps_since_device_tick = 0;
            bios.poll_keyboard();
            bios.screen.borrow_mut().display.flush_if_needed();
        }
    }
}

impl Default for TickerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
