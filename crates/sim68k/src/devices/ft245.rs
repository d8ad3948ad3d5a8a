//! FT245 parallel FIFO, wired the way the 68 Katy exposes it.
//!
//! Five byte locations spread through the I/O window: serial in/out, two
//! active-low status strobes (bit 0 low = ready), and the LED port.

use std::collections::VecDeque;

use sim_core::{
    AccessWidth, ConfigError, Device, DeviceResult, DeviceSetup, MachineContext, RegisterDef,
    Vector,
};

// offsets from the I/O window base
const REG_SERIN: u32 = 0x0000;
const REG_SEROUT: u32 = 0x2000;
const REG_STATUS_RXF: u32 = 0x4000;
const REG_STATUS_TXE: u32 = 0x5000;
const REG_DOUT: u32 = 0x6000;

/// Bit 0 low: receive fifo has data / transmit fifo has room.
const STATUS_READY: u8 = 0b1111_1110;
const STATUS_IDLE: u8 = 0b1111_1111;

pub struct Ft245 {
    rx_fifo: VecDeque<u8>,
    vr: u8,
}

impl Ft245 {
    pub const REGISTERS: &'static [RegisterDef] = &[
        RegisterDef::read("SERIN", REG_SERIN, AccessWidth::Byte),
        RegisterDef::read("SERSTATUS_RXF", REG_STATUS_RXF, AccessWidth::Byte),
        RegisterDef::read("SERSTATUS_TXE", REG_STATUS_TXE, AccessWidth::Byte),
        RegisterDef::write("SEROUT", REG_SEROUT, AccessWidth::Byte),
        RegisterDef::write("DOUT", REG_DOUT, AccessWidth::Byte),
    ];

    pub fn new(setup: &mut DeviceSetup<'_>) -> Result<Self, ConfigError> {
        setup.options().require_address(setup.name())?;
        setup.options().require_interrupt(setup.name())?;
        setup.add_registers(Self::REGISTERS)?;
        setup.register_console_input();
        Ok(Self { rx_fifo: VecDeque::new(), vr: 0 })
    }

    fn update_ipl(&self, ctx: &mut MachineContext<'_>) {
        if self.rx_fifo.is_empty() {
            ctx.deassert_ipl();
        } else {
            ctx.assert_ipl();
        }
    }
}

impl Device for Ft245 {
    fn reset(&mut self, ctx: &mut MachineContext<'_>) -> DeviceResult {
        self.rx_fifo.clear();
        self.vr = 0;
        ctx.deassert_ipl();
        Ok(())
    }

    fn read(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32) -> DeviceResult<u32> {
        let value = match offset {
            REG_SERIN => {
                let byte = self.rx_fifo.pop_front().unwrap_or(0);
                self.update_ipl(ctx);
                byte
            }
            REG_STATUS_RXF => {
                if self.rx_fifo.is_empty() {
                    STATUS_IDLE
                } else {
                    STATUS_READY
                }
            }
            REG_STATUS_TXE => STATUS_READY,
            _ => 0,
        };
        Ok(u32::from(value))
    }

    fn write(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32, value: u32) -> DeviceResult {
        match offset {
            REG_SEROUT => ctx.console_output(&[value as u8]),
            REG_DOUT => ctx.trace(&format!("LED={value}")),
            _ => {}
        }
        Ok(())
    }

    fn get_vector(&mut self, _ctx: &mut MachineContext<'_>, _level: u8) -> Vector {
        if self.vr > 0 {
            Vector::Number(self.vr)
        } else {
            Vector::Spurious
        }
    }

    fn console_input(&mut self, ctx: &mut MachineContext<'_>, bytes: &[u8]) -> DeviceResult {
        self.rx_fifo.extend(bytes);
        self.update_ipl(ctx);
        Ok(())
    }
}
