//! Simple board UART.
//!
//! Four byte registers: status, data, control, vector. The transmitter
//! is always ready; the receiver is fed from the console. Interrupt
//! enables live in the control register; the vector register supplies a
//! programmed vector, falling back to the autovector.

use std::collections::VecDeque;

use sim_core::{
    AccessWidth, ConfigError, Device, DeviceResult, DeviceSetup, MachineContext, RegisterDef,
    Vector,
};

pub const SR_RXRDY: u8 = 0x01;
pub const SR_TXRDY: u8 = 0x02;

pub const CR_RX_INTEN: u8 = 0x01;
pub const CR_TX_INTEN: u8 = 0x02;

const REG_SR: u32 = 0x01;
const REG_DR: u32 = 0x03;
const REG_CR: u32 = 0x05;
const REG_VR: u32 = 0x06;

pub struct Uart {
    rx_fifo: VecDeque<u8>,
    cr: u8,
    vr: u8,
    console: bool,
}

impl Uart {
    pub const REGISTERS: &'static [RegisterDef] = &[
        RegisterDef::read("SR", REG_SR, AccessWidth::Byte),
        RegisterDef::read("DR", REG_DR, AccessWidth::Byte),
        RegisterDef::read("CR", REG_CR, AccessWidth::Byte),
        RegisterDef::read("VR", REG_VR, AccessWidth::Byte),
        RegisterDef::write("DR", REG_DR, AccessWidth::Byte),
        RegisterDef::write("CR", REG_CR, AccessWidth::Byte),
        RegisterDef::write("VR", REG_VR, AccessWidth::Byte),
    ];

    /// Options: `address` and `interrupt` required; the presence of
    /// `console` routes this unit to the emulator console.
    pub fn new(setup: &mut DeviceSetup<'_>) -> Result<Self, ConfigError> {
        setup.options().require_address(setup.name())?;
        setup.options().require_interrupt(setup.name())?;
        setup.add_registers(Self::REGISTERS)?;
        let console = setup.options().get("console").is_some();
        if console {
            setup.register_console_input();
        }
        Ok(Self { rx_fifo: VecDeque::new(), cr: 0, vr: 0, console })
    }

    fn status(&self) -> u8 {
        let mut sr = SR_TXRDY;
        if !self.rx_fifo.is_empty() {
            sr |= SR_RXRDY;
        }
        sr
    }

    fn update_ipl(&self, ctx: &mut MachineContext<'_>) {
        if self.cr & CR_TX_INTEN != 0 {
            ctx.assert_ipl();
        } else if self.cr & CR_RX_INTEN != 0 && !self.rx_fifo.is_empty() {
            ctx.assert_ipl();
        } else {
            ctx.deassert_ipl();
        }
    }
}

impl Device for Uart {
    fn reset(&mut self, ctx: &mut MachineContext<'_>) -> DeviceResult {
        self.rx_fifo.clear();
        self.cr = 0;
        self.vr = 0;
        ctx.deassert_ipl();
        Ok(())
    }

    fn read(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32) -> DeviceResult<u32> {
        let value = match offset {
            REG_SR => self.status(),
            REG_DR => {
                let byte = self.rx_fifo.pop_front().unwrap_or(0);
                self.update_ipl(ctx);
                byte
            }
            REG_CR => self.cr,
            REG_VR => self.vr,
            _ => 0,
        };
        Ok(u32::from(value))
    }

    fn write(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32, value: u32) -> DeviceResult {
        match offset {
            REG_DR => {
                if self.console {
                    ctx.console_output(&[value as u8]);
                }
            }
            REG_CR => {
                self.cr = value as u8;
                self.update_ipl(ctx);
            }
            REG_VR => self.vr = value as u8,
            _ => {}
        }
        Ok(())
    }

    fn get_vector(&mut self, _ctx: &mut MachineContext<'_>, _level: u8) -> Vector {
        if self.vr > 0 {
            Vector::Number(self.vr)
        } else {
            Vector::Autovector
        }
    }

    fn console_input(&mut self, ctx: &mut MachineContext<'_>, bytes: &[u8]) -> DeviceResult {
        self.rx_fifo.extend(bytes);
        self.update_ipl(ctx);
        Ok(())
    }
}
