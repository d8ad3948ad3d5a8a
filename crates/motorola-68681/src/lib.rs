//! MC68681 DUART.
//!
//! Two serial channels (A/B) and the shared counter/timer, mapped to the
//! low byte of sixteen word locations. One channel can be routed to the
//! emulator console (`console-port` option: `A`, `B` or `none`). The
//! transmitter is always ready; received bytes stack up in a small fifo.
//!
//! Counter/timer rates derive from the part's 3.6864 MHz crystal scaled
//! to CPU cycles. In timer mode the output toggles at each wrap and an
//! interrupt is raised on every second toggle, matching the square-wave
//! behavior guests calibrate against.

use std::collections::VecDeque;

use sim_core::{
    AccessWidth, ConfigError, Cycles, Device, DeviceFault, DeviceResult, DeviceSetup,
    MachineContext, RegisterDef, Vector,
};

/// DUART crystal frequency in Hz.
pub const DUART_CRYSTAL_HZ: u64 = 3_686_400;

// register offsets (read side / write side share addresses)
const REG_MRA: u32 = 0x01;
const REG_SRA: u32 = 0x03; // read; CSRA on write
const REG_CRA: u32 = 0x05;
const REG_RBA: u32 = 0x07; // read; TBA on write
const REG_IPCR: u32 = 0x09; // read; ACR on write
const REG_ISR: u32 = 0x0B; // read; IMR on write
const REG_CUR: u32 = 0x0D; // read; CTUR on write
const REG_CLR: u32 = 0x0F; // read; CTLR on write
const REG_MRB: u32 = 0x11;
const REG_SRB: u32 = 0x13;
const REG_CRB: u32 = 0x15;
const REG_RBB: u32 = 0x17;
const REG_IVR: u32 = 0x19;
const REG_IPR: u32 = 0x1B; // read; OPCR on write
const REG_STARTCC: u32 = 0x1D; // read; OPRSET on write
const REG_STOPCC: u32 = 0x1F; // read; OPRCLR on write

const ISR_COUNTER: u8 = 0x08;

/// Which serial channel, for register decode and console routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Port {
    A,
    B,
}

/// One serial channel.
struct Channel {
    mr1: u8,
    mr2: u8,
    mr_alt: bool,
    rx_fifo: VecDeque<u8>,
    rx_enable: bool,
    tx_enable: bool,
}

impl Channel {
    const CTRL_CMD_MASK: u8 = 0xF0;
    const CTRL_MRRST: u8 = 0x10;
    const CTRL_RXRST: u8 = 0x20;
    const CTRL_TXRST: u8 = 0x30;
    const CTRL_TXDIS: u8 = 0x08;
    const CTRL_TXEN: u8 = 0x04;
    const CTRL_RXDIS: u8 = 0x02;
    const CTRL_RXEN: u8 = 0x01;

    const STATUS_TX_EMPTY: u8 = 0x08;
    const STATUS_TX_READY: u8 = 0x04;
    const STATUS_FIFO_FULL: u8 = 0x02;
    const STATUS_RX_READY: u8 = 0x01;

    const MR1_FFULL_EN: u8 = 0x40;

    const INT_TXRDY: u8 = 0x01;
    const INT_RXRDY_FFULL: u8 = 0x02;

    fn new() -> Self {
        Self {
            mr1: 0,
            mr2: 0,
            mr_alt: false,
            rx_fifo: VecDeque::new(),
            rx_enable: false,
            tx_enable: false,
        }
    }

    fn reset(&mut self) {
        self.mr1 = 0;
        self.mr2 = 0;
        self.mr_alt = false;
        self.rx_fifo.clear();
        self.rx_enable = false;
        self.tx_enable = false;
    }

    fn status(&self) -> u8 {
        // transmitter is always ready
        let mut sr = Self::STATUS_TX_EMPTY | Self::STATUS_TX_READY;
        if !self.rx_fifo.is_empty() {
            sr |= Self::STATUS_RX_READY;
            if self.rx_fifo.len() > 2 {
                sr |= Self::STATUS_FIFO_FULL;
            }
        }
        sr
    }

    fn read_mr(&mut self) -> u8 {
        if self.mr_alt {
            self.mr2
        } else {
            self.mr_alt = true;
            self.mr1
        }
    }

    fn write_mr(&mut self, value: u8) {
        if self.mr_alt {
            self.mr2 = value;
        } else {
            self.mr_alt = true;
            self.mr1 = value;
        }
    }

    fn read_rb(&mut self) -> u8 {
        self.rx_fifo.pop_front().unwrap_or(0xFF)
    }

    fn write_cr(&mut self, value: u8) {
        if value & Self::CTRL_RXDIS != 0 {
            self.rx_enable = false;
        } else if value & Self::CTRL_RXEN != 0 {
            self.rx_enable = true;
        }
        if value & Self::CTRL_TXDIS != 0 {
            self.tx_enable = false;
        } else if value & Self::CTRL_TXEN != 0 {
            self.tx_enable = true;
        }
        match value & Self::CTRL_CMD_MASK {
            Self::CTRL_MRRST => self.mr_alt = false,
            Self::CTRL_RXRST => {
                self.rx_enable = false;
                self.rx_fifo.clear();
            }
            Self::CTRL_TXRST => self.tx_enable = false,
            _ => {}
        }
    }

    fn interrupts(&self) -> u8 {
        let sr = self.status();
        let mut ints = 0;
        if sr & Self::STATUS_TX_READY != 0 {
            ints |= Self::INT_TXRDY;
        }
        if self.mr1 & Self::MR1_FFULL_EN != 0 {
            if sr & Self::STATUS_FIFO_FULL != 0 {
                ints |= Self::INT_RXRDY_FFULL;
            }
        } else if sr & Self::STATUS_RX_READY != 0 {
            ints |= Self::INT_RXRDY_FFULL;
        }
        ints
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterMode {
    CounterXtal16,
    TimerXtal,
    TimerXtal16,
}

impl CounterMode {
    fn from_acr(acr: u8) -> Result<Self, DeviceFault> {
        match acr & 0x70 {
            0x30 => Ok(Self::CounterXtal16),
            0x60 => Ok(Self::TimerXtal),
            0x70 => Ok(Self::TimerXtal16),
            other => Err(DeviceFault::new(format!("timer mode {other:#04x} not supported"))),
        }
    }

    fn prescale(self) -> u64 {
        match self {
            Self::TimerXtal => 1,
            Self::CounterXtal16 | Self::TimerXtal16 => 16,
        }
    }

    fn is_timer(self) -> bool {
        matches!(self, Self::TimerXtal | Self::TimerXtal16)
    }
}

/// The shared counter/timer.
struct Counter {
    mode: CounterMode,
    reload: u16,
    running: bool,
    timer_toggle: bool,
    interrupting: bool,
    epoch: Cycles,
}

const COUNTER_CALLBACK: &str = "counter";

impl Counter {
    fn new() -> Self {
        Self {
            mode: CounterMode::TimerXtal16,
            reload: 0x0100,
            running: false,
            timer_toggle: false,
            interrupting: false,
            epoch: Cycles::ZERO,
        }
    }

    /// CPU cycles per counter tick at the current prescale.
    fn scale(&self, ctx: &MachineContext<'_>) -> u64 {
        (ctx.cycle_rate() * self.mode.prescale() / DUART_CRYSTAL_HZ).max(1)
    }

    /// Cycles per counter wrap. Counter mode wraps the full 16 bits; timer
    /// mode wraps at the reload value as currently programmed.
    fn period(&self, ctx: &MachineContext<'_>) -> Cycles {
        let ticks = if self.mode.is_timer() {
            u64::from(self.reload).max(1)
        } else {
            0x10000
        };
        Cycles::new(ticks * self.scale(ctx))
    }

    fn set_mode(&mut self, ctx: &mut MachineContext<'_>, acr: u8) -> DeviceResult {
        self.mode = CounterMode::from_acr(acr)?;
        if self.mode.is_timer() && !self.running {
            // timers free-run from mode selection
            self.running = true;
            self.timer_toggle = false;
            self.arm(ctx);
        }
        Ok(())
    }

    fn start(&mut self, ctx: &mut MachineContext<'_>) {
        self.running = true;
        if self.mode.is_timer() {
            self.timer_toggle = false;
        }
        self.arm(ctx);
    }

    /// Stop command: clears the interrupt; only the counter actually
    /// stops, a timer keeps toggling.
    fn stop(&mut self, ctx: &mut MachineContext<'_>) {
        self.interrupting = false;
        if !self.mode.is_timer() {
            self.running = false;
            ctx.callback_cancel(COUNTER_CALLBACK);
        }
    }

    fn arm(&mut self, ctx: &mut MachineContext<'_>) {
        self.epoch = ctx.current_cycle() + self.period(ctx);
        ctx.callback_at(self.epoch, COUNTER_CALLBACK);
    }

    /// A wrap came due: latch the interrupt condition and re-arm for the
    /// next wrap.
    fn wrap(&mut self, ctx: &mut MachineContext<'_>) {
        if !self.running {
            return;
        }
        if self.mode.is_timer() {
            // square wave: interrupt on every second toggle
            self.timer_toggle = !self.timer_toggle;
            if !self.timer_toggle {
                self.interrupting = true;
            }
        } else {
            self.interrupting = true;
        }
        self.arm(ctx);
    }

    /// Current count, derived from the distance to the next wrap.
    fn count(&self, ctx: &MachineContext<'_>) -> u16 {
        if !self.running {
            return self.reload;
        }
        let remaining = (self.epoch - ctx.current_cycle()).get() / self.scale(ctx);
        remaining.min(0xFFFF) as u16
    }

    fn reset(&mut self) {
        self.mode = CounterMode::TimerXtal16;
        self.reload = 0x0100;
        self.running = false;
        self.timer_toggle = false;
        self.interrupting = false;
        self.epoch = Cycles::ZERO;
    }
}

/// MC68681 DUART device model.
pub struct Mc68681 {
    a: Channel,
    b: Channel,
    counter: Counter,
    isr: u8,
    imr: u8,
    ivr: u8,
    console_port: Option<Port>,
}

impl Mc68681 {
    pub const REGISTERS: &'static [RegisterDef] = &[
        RegisterDef::read("MRA", REG_MRA, AccessWidth::Byte),
        RegisterDef::read("SRA", REG_SRA, AccessWidth::Byte),
        RegisterDef::read("RBA", REG_RBA, AccessWidth::Byte),
        RegisterDef::read("IPCR", REG_IPCR, AccessWidth::Byte),
        RegisterDef::read("ISR", REG_ISR, AccessWidth::Byte),
        RegisterDef::read("CUR", REG_CUR, AccessWidth::Byte),
        RegisterDef::read("CLR", REG_CLR, AccessWidth::Byte),
        RegisterDef::read("MRB", REG_MRB, AccessWidth::Byte),
        RegisterDef::read("SRB", REG_SRB, AccessWidth::Byte),
        RegisterDef::read("RBB", REG_RBB, AccessWidth::Byte),
        RegisterDef::read("IVR", REG_IVR, AccessWidth::Byte),
        RegisterDef::read("IPR", REG_IPR, AccessWidth::Byte),
        RegisterDef::read("STARTCC", REG_STARTCC, AccessWidth::Byte),
        RegisterDef::read("STOPCC", REG_STOPCC, AccessWidth::Byte),
        RegisterDef::write("MRA", REG_MRA, AccessWidth::Byte),
        RegisterDef::write("CSRA", REG_SRA, AccessWidth::Byte),
        RegisterDef::write("CRA", REG_CRA, AccessWidth::Byte),
        RegisterDef::write("TBA", REG_RBA, AccessWidth::Byte),
        RegisterDef::write("ACR", REG_IPCR, AccessWidth::Byte),
        RegisterDef::write("IMR", REG_ISR, AccessWidth::Byte),
        RegisterDef::write("CTUR", REG_CUR, AccessWidth::Byte),
        RegisterDef::write("CTLR", REG_CLR, AccessWidth::Byte),
        RegisterDef::write("MRB", REG_MRB, AccessWidth::Byte),
        RegisterDef::write("CSRB", REG_SRB, AccessWidth::Byte),
        RegisterDef::write("CRB", REG_CRB, AccessWidth::Byte),
        RegisterDef::write("TBB", REG_RBB, AccessWidth::Byte),
        RegisterDef::write("IVR", REG_IVR, AccessWidth::Byte),
        RegisterDef::write("OPCR", REG_IPR, AccessWidth::Byte),
        RegisterDef::write("OPRSET", REG_STARTCC, AccessWidth::Byte),
        RegisterDef::write("OPRCLR", REG_STOPCC, AccessWidth::Byte),
    ];

    /// Build from a device setup. Options: `address` (required),
    /// `interrupt` (required), `console-port` = `A` | `B` | `none`
    /// (default `A`).
    pub fn new(setup: &mut DeviceSetup<'_>) -> Result<Self, ConfigError> {
        setup.options().require_address(setup.name())?;
        setup.options().require_interrupt(setup.name())?;
        setup.add_registers(Self::REGISTERS)?;

        let console_port = match setup.options().get("console-port").unwrap_or("A") {
            "A" | "a" => Some(Port::A),
            "B" | "b" => Some(Port::B),
            "none" => None,
            other => {
                return Err(ConfigError::BadOption {
                    device: setup.name().to_string(),
                    option: "console-port".to_string(),
                    value: other.to_string(),
                });
            }
        };
        if console_port.is_some() {
            setup.register_console_input();
        }

        Ok(Self {
            a: Channel::new(),
            b: Channel::new(),
            counter: Counter::new(),
            isr: 0,
            imr: 0,
            ivr: 0x0F,
            console_port,
        })
    }

    fn channel(&mut self, port: Port) -> &mut Channel {
        match port {
            Port::A => &mut self.a,
            Port::B => &mut self.b,
        }
    }

    /// Recompute ISR from channel and counter state and drive the IPL.
    fn update_status(&mut self, ctx: &mut MachineContext<'_>) {
        self.isr &= !0x3B;
        if self.counter.interrupting {
            self.isr |= ISR_COUNTER;
        }
        self.isr |= self.a.interrupts();
        self.isr |= self.b.interrupts() << 4;

        if self.isr & self.imr != 0 {
            ctx.assert_ipl();
        } else {
            ctx.deassert_ipl();
        }
    }

    fn transmit(&mut self, ctx: &mut MachineContext<'_>, port: Port, value: u8) {
        if self.console_port == Some(port) {
            ctx.console_output(&[value]);
        }
    }
}

impl Device for Mc68681 {
    fn reset(&mut self, ctx: &mut MachineContext<'_>) -> DeviceResult {
        self.a.reset();
        self.b.reset();
        self.counter.reset();
        ctx.callback_cancel(COUNTER_CALLBACK);
        // the power-on mode is a timer, and timers free-run
        self.counter.running = true;
        self.counter.arm(ctx);
        self.isr = 0;
        self.imr = 0;
        self.ivr = 0x0F;
        ctx.deassert_ipl();
        Ok(())
    }

    fn read(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32) -> DeviceResult<u32> {
        let value = match offset {
            REG_MRA => self.a.read_mr(),
            REG_SRA => self.a.status(),
            REG_RBA => self.a.read_rb(),
            REG_MRB => self.b.read_mr(),
            REG_SRB => self.b.status(),
            REG_RBB => self.b.read_rb(),
            // CTSA/CTSB are always asserted
            REG_IPCR | REG_IPR => 0x03,
            REG_ISR => self.isr,
            REG_CUR => (self.counter.count(ctx) >> 8) as u8,
            REG_CLR => (self.counter.count(ctx) & 0xFF) as u8,
            REG_IVR => self.ivr,
            REG_STARTCC => {
                self.counter.start(ctx);
                0xFF
            }
            REG_STOPCC => {
                self.counter.stop(ctx);
                0xFF
            }
            other => {
                return Err(DeviceFault::new(format!("read from {other:#04x} not handled")));
            }
        };
        self.update_status(ctx);
        Ok(u32::from(value))
    }

    fn write(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32, value: u32) -> DeviceResult {
        let value = value as u8;
        match offset {
            REG_MRA => self.a.write_mr(value),
            REG_SRA => {} // CSRA: baud-rate select, nothing to model
            REG_CRA => self.a.write_cr(value),
            REG_RBA => self.transmit(ctx, Port::A, value),
            REG_MRB => self.b.write_mr(value),
            REG_SRB => {} // CSRB
            REG_CRB => self.b.write_cr(value),
            REG_RBB => self.transmit(ctx, Port::B, value),
            REG_IPCR => self.counter.set_mode(ctx, value)?,
            REG_ISR => self.imr = value,
            REG_CUR => {
                // reload updates take effect at the next wrap
                self.counter.reload = (self.counter.reload & 0x00FF) | (u16::from(value) << 8);
            }
            REG_CLR => {
                self.counter.reload = (self.counter.reload & 0xFF00) | u16::from(value);
            }
            REG_IVR => self.ivr = value,
            REG_IPR | REG_STARTCC | REG_STOPCC => {} // OPCR/OPRSET/OPRCLR: output port, unmodeled
            other => {
                return Err(DeviceFault::new(format!("write to {other:#04x} not handled")));
            }
        }
        self.update_status(ctx);
        Ok(())
    }

    fn callback(&mut self, ctx: &mut MachineContext<'_>, _name: &'static str) -> DeviceResult {
        self.counter.wrap(ctx);
        self.update_status(ctx);
        Ok(())
    }

    fn get_vector(&mut self, _ctx: &mut MachineContext<'_>, _level: u8) -> Vector {
        if self.isr & self.imr != 0 {
            Vector::Number(self.ivr)
        } else {
            Vector::Spurious
        }
    }

    fn console_input(&mut self, ctx: &mut MachineContext<'_>, bytes: &[u8]) -> DeviceResult {
        if let Some(port) = self.console_port {
            self.channel(port).rx_fifo.extend(bytes);
            self.update_status(ctx);
        }
        Ok(())
    }
}
