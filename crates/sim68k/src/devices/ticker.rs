//! Fixed-rate system tick.
//!
//! Interrupts at 100 Hz for boards whose kernel expects a free-running
//! heartbeat. No registers; the interrupt acknowledges through the
//! autovector unless a vector is assigned.

use sim_core::{
    ConfigError, Cycles, Device, DeviceResult, DeviceSetup, MachineContext, Vector,
};

pub const TICK_HZ: u64 = 100;

const TICK: &str = "tick";

pub struct Ticker {
    period: Cycles,
    tick_fired: bool,
}

impl Ticker {
    pub fn new(setup: &mut DeviceSetup<'_>) -> Result<Self, ConfigError> {
        setup.options().require_interrupt(setup.name())?;
        Ok(Self {
            period: Cycles::new(setup.cycle_rate() / TICK_HZ),
            tick_fired: false,
        })
    }
}

impl Device for Ticker {
    fn reset(&mut self, ctx: &mut MachineContext<'_>) -> DeviceResult {
        self.tick_fired = false;
        ctx.deassert_ipl();
        ctx.callback_every(self.period, TICK);
        Ok(())
    }

    fn callback(&mut self, ctx: &mut MachineContext<'_>, _name: &'static str) -> DeviceResult {
        self.tick_fired = true;
        ctx.assert_ipl();
        Ok(())
    }

    fn get_vector(&mut self, ctx: &mut MachineContext<'_>, _level: u8) -> Vector {
        if self.tick_fired {
            self.tick_fired = false;
            ctx.deassert_ipl();
            Vector::Autovector
        } else {
            Vector::Spurious
        }
    }
}
