//! Built-in target configurations.
//!
//! A target wires memory regions and devices onto a machine for a given
//! board. Targets are generic over the CPU engine so the scripted engine
//! can drive the same configurations under test.

use std::fs::File;
use std::io::{BufWriter, Write};

use ata_compactflash::CompactFlash;
use motorola_68681::Mc68681;
use sim_core::{
    ConfigError, CpuEngine, CpuType, DeviceOptions, Machine, MachineConfig, TraceCategories,
};

use crate::cli::Args;
use crate::devices::{Disk, Ft245, Ticker, Timer, Uart};

/// Available targets and a one-line description for `--list-targets`.
pub const TARGETS: &[(&str, &str)] = &[
    ("simple", "RAM, a UART at 0xFF0000 and a timer at 0xFF1000"),
    ("tiny68k", "16 MiB RAM, MC68681 DUART at 0xFFF000, CompactFlash at 0xFFE000"),
    ("68katy", "512 KiB flash, 512 KiB RAM, FT245 console, 100 Hz tick"),
];

/// Build the machine for a named target.
pub fn configure<E: CpuEngine>(name: &str, cpu: E, args: &Args) -> Result<Machine<E>, ConfigError> {
    match name {
        "simple" => simple(cpu, args),
        "tiny68k" => tiny68k(cpu, args),
        "68katy" => katy68(cpu, args),
        other => Err(ConfigError::UnknownTarget(other.to_string())),
    }
}

fn machine_config(args: &Args, frequency_hz: u64) -> Result<MachineConfig, ConfigError> {
    let trace_output: Box<dyn Write> = Box::new(BufWriter::new(
        File::create(&args.trace_file).map_err(|source| ConfigError::Io {
            path: args.trace_file.clone(),
            source,
        })?,
    ));
    Ok(MachineConfig {
        cpu: CpuType::M68000,
        frequency_hz,
        bus_error: !args.disable_bus_error,
        cycle_limit: args.cycle_limit,
        trace_output: Some(trace_output),
        trace: TraceCategories {
            memory: args.trace_memory || args.trace_everything,
            instructions: args.trace_instructions || args.trace_everything,
            jumps: args.trace_jumps || args.trace_everything,
            exceptions: args.trace_everything,
            io: args.trace_io || args.trace_everything,
        },
        debug_devices: args.debug_devices.clone(),
    })
}

/// Simple development board: flat RAM, console UART, countdown timer and
/// an optional sector disk.
fn simple<E: CpuEngine>(cpu: E, args: &Args) -> Result<Machine<E>, ConfigError> {
    let config = machine_config(args, 8_000_000)?;
    let mut machine = Machine::new(config, cpu);

    let ram_kib = args.memory_size_kib.unwrap_or(15 * 1024);
    machine.add_memory(0, ram_kib * 1024, true)?;

    let uart = DeviceOptions::new()
        .address(0xFF0000)
        .interrupt(2)
        .option("console", "1");
    machine.add_device("uart", &uart, Uart::new)?;

    let timer = DeviceOptions::new().address(0xFF1000).interrupt(6);
    machine.add_device("timer", &timer, Timer::new)?;

    let mut disk = DeviceOptions::new().address(0xFF2000);
    if let Some(path) = &args.diskfile {
        disk = disk.option("diskfile", path.clone());
    }
    machine.add_device("disk", &disk, Disk::new)?;

    Ok(machine)
}

/// Tiny68k single-board computer: 16 MiB RAM less the device window,
/// DUART console, CompactFlash.
fn tiny68k<E: CpuEngine>(cpu: E, args: &Args) -> Result<Machine<E>, ConfigError> {
    let config = machine_config(args, 8_000_000)?;
    let mut machine = Machine::new(config, cpu);

    let ram_kib = args.memory_size_kib.unwrap_or(16 * 1024 - 32);
    machine.add_memory(0, ram_kib * 1024, true)?;

    let mut duart = DeviceOptions::new().address(0xFFF000).interrupt(2);
    if let Some(port) = &args.duart_console_port {
        duart = duart.option("console-port", port.clone());
    }
    machine.add_device("MC68681", &duart, Mc68681::new)?;

    let mut cf = DeviceOptions::new().address(0xFFE000);
    if let Some(path) = &args.diskfile {
        cf = cf.option("diskfile", path.clone());
    }
    machine.add_device("CF", &cf, CompactFlash::new)?;

    Ok(machine)
}

/// 68 Katy: flash at the bottom of the map, RAM above it, FT245 console
/// FIFO in the I/O window, free-running 100 Hz tick.
fn katy68<E: CpuEngine>(cpu: E, args: &Args) -> Result<Machine<E>, ConfigError> {
    let config = machine_config(args, 8_000_000)?;
    let mut machine = Machine::new(config, cpu);

    // not all of the 512 KiB flash is decoded
    let rom_size = 0x78000;
    match &args.rom {
        Some(path) => machine.add_memory_from_file(0, rom_size, false, path)?,
        None => machine.add_memory(0, rom_size, false)?,
    }
    machine.add_memory(0x80000, 0x80000, true)?;

    let ft245 = DeviceOptions::new().address(0x78000).interrupt(2);
    machine.add_device("FT245RL", &ft245, Ft245::new)?;

    let ticker = DeviceOptions::new().interrupt(5);
    machine.add_device("ticker", &ticker, Ticker::new)?;

    Ok(machine)
}
