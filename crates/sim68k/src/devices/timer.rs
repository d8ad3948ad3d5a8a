//! Simple board timer.
//!
//! Reports absolute time in microseconds and counts down a programmed
//! number of microseconds, raising its interrupt when the countdown
//! lands. Writing zero cancels a running countdown.

use sim_core::{
    AccessWidth, ConfigError, Cycles, Device, DeviceResult, DeviceSetup, MachineContext,
    RegisterDef, Vector,
};

const REG_COUNT: u32 = 0x00;
const REG_VECTOR: u32 = 0x05;

const COUNTDOWN: &str = "count";

pub struct Timer {
    /// CPU cycles per microsecond.
    scaler: u64,
    deadline: Cycles,
    vr: u8,
}

impl Timer {
    pub const REGISTERS: &'static [RegisterDef] = &[
        RegisterDef::read("COUNT", REG_COUNT, AccessWidth::Long),
        RegisterDef::read("VECTOR", REG_VECTOR, AccessWidth::Byte),
        RegisterDef::write("COUNT", REG_COUNT, AccessWidth::Long),
        RegisterDef::write("VECTOR", REG_VECTOR, AccessWidth::Byte),
    ];

    pub fn new(setup: &mut DeviceSetup<'_>) -> Result<Self, ConfigError> {
        setup.options().require_address(setup.name())?;
        setup.options().require_interrupt(setup.name())?;
        setup.add_registers(Self::REGISTERS)?;
        Ok(Self {
            scaler: (setup.cycle_rate() / 1_000_000).max(1),
            deadline: Cycles::ZERO,
            vr: 0,
        })
    }
}

impl Device for Timer {
    fn reset(&mut self, ctx: &mut MachineContext<'_>) -> DeviceResult {
        self.deadline = Cycles::ZERO;
        self.vr = 0;
        ctx.deassert_ipl();
        ctx.callback_cancel(COUNTDOWN);
        Ok(())
    }

    fn read(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32) -> DeviceResult<u32> {
        match offset {
            REG_COUNT => Ok((ctx.current_cycle().get() / self.scaler) as u32),
            REG_VECTOR => Ok(u32::from(self.vr)),
            _ => Ok(0),
        }
    }

    fn write(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32, value: u32) -> DeviceResult {
        match offset {
            REG_COUNT => {
                if value == 0 {
                    ctx.deassert_ipl();
                    self.deadline = Cycles::ZERO;
                    ctx.callback_cancel(COUNTDOWN);
                    ctx.trace("timer cancelled");
                } else {
                    self.deadline =
                        ctx.current_cycle() + Cycles::new(u64::from(value) * self.scaler);
                    ctx.callback_at(self.deadline, COUNTDOWN);
                    ctx.trace(&format!(
                        "timer set for {}, now {}",
                        self.deadline,
                        ctx.current_cycle()
                    ));
                }
            }
            REG_VECTOR => self.vr = value as u8,
            _ => {}
        }
        Ok(())
    }

    fn callback(&mut self, ctx: &mut MachineContext<'_>, _name: &'static str) -> DeviceResult {
        if self.deadline.get() > 0 {
            ctx.trace("timer expired");
            ctx.assert_ipl();
            self.deadline = Cycles::ZERO;
        }
        Ok(())
    }

    fn get_vector(&mut self, ctx: &mut MachineContext<'_>, _level: u8) -> Vector {
        ctx.deassert_ipl();
        if self.vr > 0 {
            Vector::Number(self.vr)
        } else {
            Vector::Autovector
        }
    }
}
