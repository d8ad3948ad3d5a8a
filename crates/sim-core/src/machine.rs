//! The machine: device registry, bus dispatch, and the emulator loop.
//!
//! One `Machine` value owns the CPU engine, every device, the register
//! table, the address map, the scheduler, the interrupt state and the
//! trace sink. Devices are addressed by registration index and reach
//! framework services only through the [`MachineContext`] passed into
//! each call; there is no global state anywhere.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use format_elf::ElfImage;

use crate::clock::{Clock, Cycles};
use crate::console::{ConsoleSink, NullConsole};
use crate::cpu::{
    AccessWidth, BusFault, CpuAccess, CpuControl, CpuEngine, CpuRegister, CpuSystem, CpuType,
    MemOperation, Vector, IRQ_SPURIOUS,
};
use crate::device::{Device, DeviceFault, DeviceId, DeviceOptions, DeviceResult};
use crate::error::ConfigError;
use crate::interrupts::InterruptController;
use crate::memory::MemoryMap;
use crate::registers::{Access, RegisterDef, RegisterTable};
use crate::scheduler::Scheduler;
use crate::services;
use crate::trace::{format_value, Trace, TraceCategories};

/// Why the run loop stopped.
#[derive(Debug)]
pub enum ExitReason {
    CycleLimit,
    Shutdown,
    UserInterrupt,
    Fatal(String),
}

impl ExitReason {
    /// Clean terminations exit with status 0.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CycleLimit => write!(f, "cycle limit reached"),
            Self::Shutdown => write!(f, "shutdown requested"),
            Self::UserInterrupt => write!(f, "user interrupt"),
            Self::Fatal(diag) => write!(f, "fatal: {diag}"),
        }
    }
}

/// Startup configuration.
pub struct MachineConfig {
    pub cpu: CpuType,
    pub frequency_hz: u64,
    /// Raise bus errors on unmapped accesses (otherwise open bus).
    pub bus_error: bool,
    pub cycle_limit: Option<u64>,
    /// Trace sink; `None` discards.
    pub trace_output: Option<Box<dyn Write>>,
    pub trace: TraceCategories,
    /// Device names with framework debug tracing enabled.
    pub debug_devices: Vec<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpu: CpuType::M68000,
            frequency_hz: 8_000_000,
            bus_error: true,
            cycle_limit: None,
            trace_output: None,
            trace: TraceCategories::default(),
            debug_devices: Vec::new(),
        }
    }
}

pub(crate) struct ConsolePlumbing {
    /// Device output bytes waiting for the sink.
    pub output: Vec<u8>,
    /// Device receiving console input, if any.
    pub input_device: Option<DeviceId>,
}

/// Machine state reachable from device dispatch; grouped so the registry
/// can be split-borrowed against the device being called.
pub(crate) struct Shared {
    pub clock: Clock,
    pub elapsed: Cycles,
    pub quantum_end: Cycles,
    pub control: CpuControl,
    pub scheduler: Scheduler,
    pub interrupts: InterruptController,
    pub trace: Trace,
    pub console: ConsolePlumbing,
    pub exit: Option<ExitReason>,
    pub trace_limit: Option<Cycles>,
    pub bus_error: bool,
}

impl Shared {
    /// Exact current cycle, including progress into a running quantum.
    pub fn current_cycle(&self) -> Cycles {
        self.elapsed + Cycles::new(self.control.cycles_into_quantum)
    }

    pub fn request_exit(&mut self, reason: ExitReason) {
        if self.exit.is_none() {
            self.exit = Some(reason);
        }
        self.control.end_timeslice = true;
    }

    fn fatal_device(&mut self, device: &str, fault: &DeviceFault) {
        self.trace.line("FATAL", None, &format!("{device}: {fault}"));
        self.request_exit(ExitReason::Fatal(format!("device '{device}': {fault}")));
    }

    /// After a scheduler mutation: if the earliest deadline now falls
    /// inside the running quantum, ask the engine to end it there.
    fn couple_deadline(&mut self) {
        if let Some(earliest) = self.scheduler.earliest() {
            if earliest < self.quantum_end {
                let into_quantum = (earliest - self.elapsed).get();
                self.control.shorten(into_quantum);
            }
        }
    }
}

struct DeviceSlot {
    name: String,
    device: Box<dyn Device>,
    debug: bool,
}

/// Framework capability set passed to every device call.
pub struct MachineContext<'m> {
    device: DeviceId,
    name: &'m str,
    debug: bool,
    shared: &'m mut Shared,
}

impl MachineContext<'_> {
    /// Cycles elapsed since reset, exact even mid-quantum.
    #[must_use]
    pub fn current_cycle(&self) -> Cycles {
        self.shared.current_cycle()
    }

    /// Microseconds elapsed since reset.
    #[must_use]
    pub fn current_time_us(&self) -> u64 {
        self.shared.clock.micros(self.current_cycle())
    }

    /// CPU cycles per second.
    #[must_use]
    pub fn cycle_rate(&self) -> u64 {
        self.shared.clock.frequency_hz
    }

    /// The IPL assigned to this device at construction, if any.
    #[must_use]
    pub fn interrupt(&self) -> Option<u8> {
        self.shared.interrupts.assigned(self.device)
    }

    /// One-shot callback at an absolute cycle.
    pub fn callback_at(&mut self, cycle: Cycles, name: &'static str) {
        let now = self.current_cycle();
        self.shared.scheduler.schedule_at(self.device, name, cycle, now);
        self.shared.couple_deadline();
    }

    /// One-shot callback `delta` cycles from now.
    pub fn callback_after(&mut self, delta: Cycles, name: &'static str) {
        let now = self.current_cycle();
        self.shared.scheduler.schedule_after(self.device, name, delta, now);
        self.shared.couple_deadline();
    }

    /// Periodic callback every `period` cycles.
    pub fn callback_every(&mut self, period: Cycles, name: &'static str) {
        let now = self.current_cycle();
        self.shared.scheduler.schedule_every(self.device, name, period, now);
        self.shared.couple_deadline();
    }

    pub fn callback_cancel(&mut self, name: &'static str) {
        self.shared.scheduler.cancel(self.device, name);
    }

    /// Latch this device's assigned IPL.
    pub fn assert_ipl(&mut self) {
        self.shared.interrupts.assert_ipl(self.device, None);
    }

    /// Latch an explicit IPL.
    pub fn assert_ipl_level(&mut self, level: u8) {
        self.shared.interrupts.assert_ipl(self.device, Some(level));
    }

    pub fn deassert_ipl(&mut self) {
        self.shared.interrupts.deassert_ipl(self.device);
    }

    /// Queue bytes for the console sink.
    pub fn console_output(&mut self, bytes: &[u8]) {
        self.shared.console.output.extend_from_slice(bytes);
    }

    /// Become the console input device.
    pub fn register_console_input(&mut self) {
        self.shared.console.input_device = Some(self.device);
    }

    /// Framework debug trace for this device (only when its debug flag is
    /// set).
    pub fn trace(&mut self, info: &str) {
        if self.debug {
            let line = format!("{}: {info}", self.name);
            self.shared.trace.line("DEVICE", None, &line);
        }
    }
}

/// Dispatch one call into a device, capturing a fault into the fatal flag.
fn dispatch<R>(
    devices: &mut [DeviceSlot],
    shared: &mut Shared,
    id: DeviceId,
    f: impl FnOnce(&mut dyn Device, &mut MachineContext<'_>) -> DeviceResult<R>,
) -> Option<R> {
    let slot = &mut devices[id];
    let mut ctx = MachineContext {
        device: id,
        name: &slot.name,
        debug: slot.debug,
        shared: &mut *shared,
    };
    match f(slot.device.as_mut(), &mut ctx) {
        Ok(value) => Some(value),
        Err(fault) => {
            let name = slot.name.clone();
            shared.fatal_device(&name, &fault);
            None
        }
    }
}

/// Construction-time view handed to a device builder: register mapping,
/// option access, clock views.
pub struct DeviceSetup<'m> {
    id: DeviceId,
    name: &'m str,
    base: Option<u32>,
    options: &'m DeviceOptions,
    registers: &'m mut RegisterTable,
    shared: &'m mut Shared,
    max_end: u32,
}

impl DeviceSetup<'_> {
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    #[must_use]
    pub fn options(&self) -> &DeviceOptions {
        self.options
    }

    #[must_use]
    pub fn cycle_rate(&self) -> u64 {
        self.shared.clock.frequency_hz
    }

    #[must_use]
    pub fn interrupt(&self) -> Option<u8> {
        self.options.interrupt
    }

    /// Map one register at the device base.
    pub fn add_register(&mut self, def: &RegisterDef) -> Result<(), ConfigError> {
        let base = self.base.ok_or_else(|| ConfigError::NoBaseAddress {
            device: self.name.to_string(),
        })?;
        self.registers.add(self.id, self.name, base, def)?;
        self.max_end = self.max_end.max(def.offset + def.width.bytes());
        Ok(())
    }

    /// Map a batch of registers.
    pub fn add_registers(&mut self, defs: &[RegisterDef]) -> Result<(), ConfigError> {
        for def in defs {
            self.add_register(def)?;
        }
        Ok(())
    }

    /// Become the console input device.
    pub fn register_console_input(&mut self) {
        self.shared.console.input_device = Some(self.id);
    }
}

pub struct Machine<E: CpuEngine> {
    cpu: E,
    devices: Vec<DeviceSlot>,
    registers: RegisterTable,
    memory: MemoryMap,
    shared: Shared,
    console: Box<dyn ConsoleSink>,
    cycle_limit: Option<Cycles>,
    debug_devices: Vec<String>,
    interrupt_flag: Option<Arc<AtomicBool>>,
    sigint_first: Option<Instant>,
    sigint_count: u32,
}

impl<E: CpuEngine> fmt::Debug for Machine<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine").finish_non_exhaustive()
    }
}

impl<E: CpuEngine> Machine<E> {
    pub fn new(config: MachineConfig, mut cpu: E) -> Self {
        cpu.set_cpu_type(config.cpu);
        cpu.init();
        let mut trace = Trace::new(config.trace_output.unwrap_or_else(|| Box::new(io::sink())));
        *trace.categories_mut() = config.trace;
        cpu.set_memory_tracing(config.trace.memory);
        cpu.set_instruction_tracing(config.trace.instructions);

        Self {
            cpu,
            devices: Vec::new(),
            registers: RegisterTable::new(),
            memory: MemoryMap::new(),
            shared: Shared {
                clock: Clock::new(config.frequency_hz),
                elapsed: Cycles::ZERO,
                quantum_end: Cycles::ZERO,
                control: CpuControl::default(),
                scheduler: Scheduler::new(),
                interrupts: InterruptController::new(),
                trace,
                console: ConsolePlumbing { output: Vec::new(), input_device: None },
                exit: None,
                trace_limit: None,
                bus_error: config.bus_error,
            },
            console: Box::new(NullConsole),
            cycle_limit: config.cycle_limit.map(Cycles::new),
            debug_devices: config.debug_devices,
            interrupt_flag: None,
            sigint_first: None,
            sigint_count: 0,
        }
    }

    /// Declare a RAM/ROM region.
    pub fn add_memory(&mut self, base: u32, size: u32, writable: bool) -> Result<(), ConfigError> {
        self.memory.add_region(base, size, writable)?;
        self.cpu.add_memory(base, size, writable);
        Ok(())
    }

    /// Declare a region and fill it from a file (ROM images).
    pub fn add_memory_from_file(
        &mut self,
        base: u32,
        size: u32,
        writable: bool,
        path: &Path,
    ) -> Result<(), ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.len() as u32 > size {
            return Err(ConfigError::LoadOutsideMemory { address: base, size: bytes.len() as u32 });
        }
        self.add_memory(base, size, writable)?;
        self.cpu.write_bulk(base, &bytes);
        Ok(())
    }

    /// Construct and register a device. The builder runs with a
    /// [`DeviceSetup`] for register mapping and option access; the new
    /// device's id is its registration index.
    pub fn add_device<D, F>(
        &mut self,
        name: &str,
        options: &DeviceOptions,
        build: F,
    ) -> Result<DeviceId, ConfigError>
    where
        D: Device + 'static,
        F: FnOnce(&mut DeviceSetup<'_>) -> Result<D, ConfigError>,
    {
        if let Some(ipl) = options.interrupt {
            if !(1..=7).contains(&ipl) {
                return Err(ConfigError::BadOption {
                    device: name.to_string(),
                    option: "interrupt".to_string(),
                    value: ipl.to_string(),
                });
            }
        }
        let id = self.devices.len();
        self.shared.interrupts.add_device(options.interrupt);
        let mut setup = DeviceSetup {
            id,
            name,
            base: options.address,
            options,
            registers: &mut self.registers,
            shared: &mut self.shared,
            max_end: 0,
        };
        let device = build(&mut setup)?;
        let size = (setup.max_end + 3) & !3;
        if let Some(base) = options.address {
            if size > 0 {
                self.memory.add_device_range(base, size, id)?;
                self.cpu.add_device_range(base, size);
            }
        }
        self.devices.push(DeviceSlot {
            name: name.to_string(),
            device: Box::new(device),
            debug: self.debug_devices.iter().any(|d| d == name),
        });
        Ok(id)
    }

    /// Load an executable image: segments into memory, initial SP and
    /// entry point into vectors 0/1, symbols into the trace sink.
    pub fn load_image(&mut self, bytes: &[u8], load_base: u32) -> Result<(), ConfigError> {
        let image = ElfImage::load(bytes, load_base)?;
        for seg in image.segments() {
            self.memory.check_load(seg.address, seg.data.len() as u32)?;
            self.cpu.write_bulk(seg.address, &seg.data);
            self.shared.trace.line(
                "LOAD",
                Some(seg.address),
                &format!("{} {:#x} bytes", seg.name, seg.data.len()),
            );
        }
        if let Some(sp) = image.initial_sp() {
            self.cpu.write_memory(0, AccessWidth::Long, sp);
        }
        self.cpu.write_memory(4, AccessWidth::Long, image.entry());
        self.shared.trace.add_symbols(image.into_symbols());
        Ok(())
    }

    pub fn load_image_file(&mut self, path: &Path, load_base: u32) -> Result<(), ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_image(&bytes, load_base)
    }

    /// Add an ELF file for trace symbolication only.
    pub fn add_symbols_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.shared.trace.add_symbols(ElfImage::load_symbols(&bytes)?);
        Ok(())
    }

    /// Install the console sink.
    pub fn add_console(&mut self, sink: Box<dyn ConsoleSink>) {
        self.console = sink;
    }

    /// Flag polled for SIGINT debouncing; set from a signal handler.
    pub fn set_interrupt_flag(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt_flag = Some(flag);
    }

    /// Toggle a trace category by name.
    pub fn trace_enable(&mut self, what: &str, on: bool) -> bool {
        let ok = self.shared.trace.enable(what, on);
        self.sync_engine_tracing();
        ok
    }

    #[must_use]
    pub fn elapsed(&self) -> Cycles {
        self.shared.elapsed
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.shared.clock
    }

    #[must_use]
    pub fn cpu(&self) -> &E {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut E {
        &mut self.cpu
    }

    pub fn read_memory(&mut self, addr: u32, width: AccessWidth) -> u32 {
        self.cpu.read_memory(addr, width)
    }

    pub fn write_memory(&mut self, addr: u32, width: AccessWidth, value: u32) {
        self.cpu.write_memory(addr, width, value);
    }

    /// Run to termination: reset devices, pulse the CPU, then drive it in
    /// quanta until something stops the machine.
    pub fn run(&mut self) -> ExitReason {
        self.reset_devices();
        if let Some(reason) = self.shared.exit.take() {
            return reason;
        }
        self.cpu.pulse_reset();
        let started = Instant::now();
        let reason = self.run_loop();
        self.finish(started);
        reason
    }

    fn run_loop(&mut self) -> ExitReason {
        loop {
            if let Some(reason) = self.shared.exit.take() {
                return reason;
            }
            self.poll_user_interrupt();
            self.poll_console();
            self.drain_console_output();
            if let Some(reason) = self.shared.exit.take() {
                return reason;
            }

            let quantum = self.next_quantum();
            self.shared.quantum_end = self.shared.elapsed + quantum;
            self.prime_control();
            let ran = {
                let mut system = System {
                    devices: &mut self.devices,
                    registers: &self.registers,
                    shared: &mut self.shared,
                };
                self.cpu.execute(&mut system, quantum)
            };
            self.shared.elapsed += ran;
            self.shared.control.cycles_into_quantum = 0;

            self.fire_due_callbacks();
            self.drain_console_output();
            self.sync_engine_tracing();

            if let Some(limit) = self.shared.trace_limit {
                if self.shared.elapsed >= limit {
                    self.shared.trace.enable("everything", false);
                    self.shared.trace_limit = None;
                    self.sync_engine_tracing();
                }
            }
            if let Some(limit) = self.cycle_limit {
                if self.shared.elapsed >= limit {
                    return ExitReason::CycleLimit;
                }
            }
        }
    }

    /// Quantum for the next `execute` call: a millisecond of simulated
    /// time, cut short by the nearest deadline and the cycle/trace limits.
    fn next_quantum(&self) -> Cycles {
        let mut quantum = self.shared.clock.default_quantum();
        if let Some(earliest) = self.shared.scheduler.earliest() {
            let until = earliest - self.shared.elapsed;
            quantum = quantum.min(if until.get() == 0 { Cycles::new(1) } else { until });
        }
        if let Some(limit) = self.cycle_limit {
            quantum = quantum.min(limit - self.shared.elapsed);
        }
        if let Some(limit) = self.shared.trace_limit {
            let until = limit - self.shared.elapsed;
            if until.get() > 0 {
                quantum = quantum.min(until);
            }
        }
        quantum.max(Cycles::new(1))
    }

    /// Apply pending requests and clear the block before a quantum.
    fn prime_control(&mut self) {
        let control = &mut self.shared.control;
        control.cycles_into_quantum = 0;
        control.end_timeslice = false;
        control.shorten_to = None;
        control.bus_error = None;
        if let Some(level) = control.irq.take() {
            self.cpu.set_irq(level);
        }
    }

    fn fire_due_callbacks(&mut self) {
        while let Some((id, name)) = self.shared.scheduler.pop_due(self.shared.elapsed) {
            dispatch(&mut self.devices, &mut self.shared, id, |d, ctx| d.callback(ctx, name));
            if self.shared.exit.is_some() {
                return;
            }
        }
        self.check_interrupts_idle();
    }

    /// Between quanta the engine is idle: drive its IRQ input directly.
    fn check_interrupts_idle(&mut self) {
        let level = self.shared.interrupts.max_ipl();
        self.cpu.set_irq(level);
        self.shared.control.irq = None;
    }

    fn sync_engine_tracing(&mut self) {
        let categories = self.shared.trace.categories();
        self.cpu.set_memory_tracing(categories.memory);
        self.cpu.set_instruction_tracing(categories.instructions);
    }

    fn reset_devices(&mut self) {
        self.shared.trace.line("RESET", None, "resetting devices");
        for id in 0..self.devices.len() {
            dispatch(&mut self.devices, &mut self.shared, id, |d, ctx| d.reset(ctx));
            if self.shared.exit.is_some() {
                return;
            }
        }
        self.check_interrupts_idle();
    }

    fn poll_console(&mut self) {
        match self.console.poll() {
            Ok(Some(bytes)) => self.deliver_console_input(&bytes),
            Ok(None) => {}
            Err(e) => self.shared.request_exit(ExitReason::Fatal(format!("console: {e}"))),
        }
    }

    fn deliver_console_input(&mut self, bytes: &[u8]) {
        if let Some(id) = self.shared.console.input_device {
            dispatch(&mut self.devices, &mut self.shared, id, |d, ctx| {
                d.console_input(ctx, bytes)
            });
            self.check_interrupts_idle();
        }
    }

    fn drain_console_output(&mut self) {
        if !self.shared.console.output.is_empty() {
            let buffered = std::mem::take(&mut self.shared.console.output);
            self.console.send(&buffered);
        }
    }

    /// SIGINT debounce: three presses within a second terminate, fewer
    /// forward ETX to the console input device.
    fn poll_user_interrupt(&mut self) {
        let Some(flag) = &self.interrupt_flag else {
            return;
        };
        if !flag.swap(false, Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        match self.sigint_first {
            Some(first) if now.duration_since(first) < Duration::from_secs(1) => {
                self.sigint_count += 1;
                if self.sigint_count >= 3 {
                    self.shared.request_exit(ExitReason::UserInterrupt);
                    return;
                }
            }
            _ => {
                self.sigint_first = Some(now);
                self.sigint_count = 1;
            }
        }
        self.deliver_console_input(&[0x03]);
    }

    fn finish(&mut self, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        let cycles = self.shared.elapsed.get();
        let cps = if elapsed > 0.0 { (cycles as f64 / elapsed) as u64 } else { 0 };
        let summary = format!("{cycles} cycles in {elapsed:.3} seconds, {cps} cps");
        self.shared.trace.log(&summary);
    }
}

/// The callback surface handed to the CPU engine for one quantum.
pub(crate) struct System<'m> {
    devices: &'m mut [DeviceSlot],
    registers: &'m RegisterTable,
    shared: &'m mut Shared,
}

impl System<'_> {
    /// Recompute the aggregate IPL, drive the IRQ line, and end the
    /// quantum early when an unmasked interrupt is pending. The engine
    /// only samples interrupts at quantum boundaries.
    fn check_interrupts(&mut self, cpu: &mut dyn CpuAccess) {
        let level = self.shared.interrupts.max_ipl();
        self.shared.control.irq = Some(level);
        if level > 0 {
            let cpl = ((cpu.get_reg(CpuRegister::Sr) >> 8) & 7) as u8;
            if level > cpl {
                self.shared.control.end_timeslice = true;
            }
        }
    }
}

impl CpuSystem for System<'_> {
    fn device_access(
        &mut self,
        cpu: &mut dyn CpuAccess,
        operation: MemOperation,
        address: u32,
        width: AccessWidth,
        value: u32,
    ) -> u32 {
        let access = match operation {
            MemOperation::Read => Access::Read,
            MemOperation::Write => Access::Write,
        };
        let Some(reg) = self.registers.lookup(address, width, access) else {
            let verb = match operation {
                MemOperation::Read => "read",
                MemOperation::Write => "write",
            };
            self.shared.trace.line(
                "DECODE",
                Some(address),
                &format!("no register for {}-bit {verb}", width.bits()),
            );
            if self.shared.bus_error {
                self.shared.control.bus_error =
                    Some(BusFault { operation, address, width });
            }
            return 0;
        };

        let io_trace = self.shared.trace.categories().io || self.devices[reg.device].debug;
        let result = match operation {
            MemOperation::Read => {
                let read = dispatch(self.devices, self.shared, reg.device, |d, ctx| {
                    d.read(ctx, width, reg.offset)
                });
                let value = width.truncate(read.unwrap_or(0));
                if io_trace {
                    let info = format!("{} -> {}", reg.name, format_value(width, value));
                    self.shared.trace.line("DEV_READ", Some(address), &info);
                }
                value
            }
            MemOperation::Write => {
                let value = width.truncate(value);
                if io_trace {
                    let info = format!("{} <- {}", reg.name, format_value(width, value));
                    self.shared.trace.line("DEV_WRITE", Some(address), &info);
                }
                dispatch(self.devices, self.shared, reg.device, |d, ctx| {
                    d.write(ctx, width, reg.offset, value)
                });
                0
            }
        };
        self.check_interrupts(cpu);
        result
    }

    fn interrupt_ack(&mut self, cpu: &mut dyn CpuAccess, level: u8) -> u32 {
        let candidates: Vec<DeviceId> = self.shared.interrupts.devices_at(level).collect();
        for id in candidates {
            let vector = dispatch(self.devices, self.shared, id, |d, ctx| {
                Ok(d.get_vector(ctx, level))
            });
            match vector {
                Some(Vector::Spurious) | None => {}
                Some(vector) => {
                    self.check_interrupts(cpu);
                    return vector.raw();
                }
            }
        }
        self.shared.trace.line("INT", None, &format!("no device claims level {level}"));
        self.check_interrupts(cpu);
        IRQ_SPURIOUS
    }

    fn reset_instruction(&mut self, _cpu: &mut dyn CpuAccess) {
        self.shared.trace.line("RESET", None, "reset instruction");
        self.shared.control.end_timeslice = true;
        for id in 0..self.devices.len() {
            dispatch(self.devices, self.shared, id, |d, ctx| d.reset(ctx));
            if self.shared.exit.is_some() {
                return;
            }
        }
    }

    fn illegal_instruction(&mut self, cpu: &mut dyn CpuAccess, opcode: u16) -> bool {
        services::handle(self.shared, cpu, opcode)
    }

    fn instruction_hook(&mut self, cpu: &mut dyn CpuAccess, pc: u32) {
        if !self.shared.trace.categories().instructions {
            return;
        }
        let dis = cpu.disassemble(pc);
        let mut info = format!("{dis:30}");
        for (name, reg) in REGISTER_NAMES {
            if dis.contains(name) {
                let value = cpu.get_reg(*reg);
                info.push_str(&format!(" {name}={value:#x}"));
            }
        }
        self.shared.trace.line("EXECUTE", Some(pc), &info);
    }

    fn pc_changed(&mut self, cpu: &mut dyn CpuAccess, new_pc: u32, vector: u32) {
        if vector == 0 {
            if self.shared.trace.categories().jumps {
                self.shared.trace.line("JUMP", Some(new_pc), "");
            }
        } else if self.shared.trace.categories().exceptions {
            let ppc = cpu.get_reg(CpuRegister::Ppc);
            let info = format!("vector {vector:#x} to {new_pc:#x}");
            self.shared.trace.line("EXCEPTION", Some(ppc), &info);
        }
    }

    fn memory_trace(&mut self, operation: MemOperation, address: u32, width: AccessWidth, value: u32) {
        if !self.shared.trace.categories().memory {
            return;
        }
        let action = match operation {
            MemOperation::Read => "READ",
            MemOperation::Write => "WRITE",
        };
        self.shared.trace.line(action, Some(address), &format_value(width, value));
    }

    fn control(&mut self) -> &mut CpuControl {
        &mut self.shared.control
    }
}

/// Registers the instruction tracer annotates when the disassembly
/// mentions them.
const REGISTER_NAMES: &[(&str, CpuRegister)] = &[
    ("D0", CpuRegister::D0),
    ("D1", CpuRegister::D1),
    ("D2", CpuRegister::D2),
    ("D3", CpuRegister::D3),
    ("D4", CpuRegister::D4),
    ("D5", CpuRegister::D5),
    ("D6", CpuRegister::D6),
    ("D7", CpuRegister::D7),
    ("A0", CpuRegister::A0),
    ("A1", CpuRegister::A1),
    ("A2", CpuRegister::A2),
    ("A3", CpuRegister::A3),
    ("A4", CpuRegister::A4),
    ("A5", CpuRegister::A5),
    ("A6", CpuRegister::A6),
    ("A7", CpuRegister::A7),
];
