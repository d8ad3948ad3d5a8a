//! Device framework core for a 68000-family system emulator.
//!
//! The instruction interpreter is an external collaborator behind the
//! [`CpuEngine`] trait; everything else a system model needs lives here:
//! register-mapped bus dispatch, a cooperative cycle-deadline scheduler,
//! prioritized interrupt aggregation, the quantum-driven emulator loop,
//! executable loading with relocation, and the trace sink.

mod clock;
mod console;
mod cpu;
mod device;
mod error;
mod interrupts;
mod machine;
mod memory;
mod registers;
mod scheduler;
mod services;
mod trace;

pub mod scripted;

pub use clock::{Clock, Cycles};
pub use console::{ConsoleSink, NullConsole, SocketConsole, StdoutConsole, CONSOLE_PORT};
pub use cpu::{
    AccessWidth, BusFault, CpuAccess, CpuControl, CpuEngine, CpuRegister, CpuSystem, CpuType,
    MemOperation, Vector, IRQ_AUTOVECTOR, IRQ_SPURIOUS,
};
pub use device::{Device, DeviceFault, DeviceId, DeviceOptions, DeviceResult};
pub use error::ConfigError;
pub use machine::{DeviceSetup, ExitReason, Machine, MachineConfig, MachineContext};
pub use memory::{MemoryMap, MemoryRegion};
pub use registers::{Access, Register, RegisterDef, RegisterTable};
pub use scheduler::Scheduler;
pub use services::{ERR_SENTINEL, OP_IDENTIFY, OP_INVOKE, VERSION};
pub use trace::{format_value, Trace, TraceCategories};

pub use format_elf::{ElfError, ElfImage, Symbol, SymbolStore};
