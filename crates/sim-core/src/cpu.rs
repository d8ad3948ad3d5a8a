//! CPU engine contract.
//!
//! The instruction interpreter is an external collaborator. The framework
//! drives it in cycle quanta through [`CpuEngine`] and receives callbacks
//! during execution through [`CpuSystem`]. Each callback gets a
//! [`CpuAccess`] view of registers and guest memory, valid only for the
//! duration of the callback.
//!
//! Engine contract for callbacks:
//!
//! - before invoking any `CpuSystem` method, the engine stores its
//!   current cycles-run count into `control().cycles_into_quantum`;
//! - after the method returns, the engine applies and clears every request
//!   posted in the [`CpuControl`] block (IRQ level, end-of-timeslice,
//!   quantum shortening, bus-error delivery).
//!
//! This is how framework code running inside a memory access can observe
//! exact mid-quantum time and interrupt an otherwise long instruction run.

use crate::clock::Cycles;

/// Interrupt-acknowledge result: no vector supplied, use `24 + level`.
pub const IRQ_AUTOVECTOR: u32 = 0xFFFF_FFFF;
/// Interrupt-acknowledge result: nobody claimed the interrupt.
pub const IRQ_SPURIOUS: u32 = 0xFFFF_FFFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuType {
    M68000,
    M68010,
    M68Ec020,
    M68020,
}

impl CpuType {
    /// Engine type code (native library numbering).
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::M68000 => 1,
            Self::M68010 => 2,
            Self::M68Ec020 => 3,
            Self::M68020 => 4,
        }
    }

    /// Parse a target-file CPU name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "68000" => Some(Self::M68000),
            "68010" => Some(Self::M68010),
            "68EC020" => Some(Self::M68Ec020),
            "68020" => Some(Self::M68020),
            _ => None,
        }
    }
}

/// CPU register identifiers, numbered as the native library numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuRegister {
    D0 = 0,
    D1,
    D2,
    D3,
    D4,
    D5,
    D6,
    D7,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    Pc = 16,
    Sr = 17,
    Sp = 18,
    Usp = 19,
    Isp = 20,
    Ppc = 29,
}

impl CpuRegister {
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// Bus access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    Byte,
    Word,
    Long,
}

impl AccessWidth {
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Byte => 8,
            Self::Word => 16,
            Self::Long => 32,
        }
    }

    #[must_use]
    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Self::Byte),
            16 => Some(Self::Word),
            32 => Some(Self::Long),
            _ => None,
        }
    }

    /// Mask a value down to the access width.
    #[must_use]
    pub const fn truncate(self, value: u32) -> u32 {
        match self {
            Self::Byte => value & 0xFF,
            Self::Word => value & 0xFFFF,
            Self::Long => value,
        }
    }
}

/// Direction of a bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemOperation {
    Read,
    Write,
}

/// Vector supplied by a device during interrupt acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    /// Programmed vector number.
    Number(u8),
    /// Let the CPU synthesize `24 + level`.
    Autovector,
    /// This device is not interrupting.
    Spurious,
}

impl Vector {
    /// Raw encoding handed back to the engine.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::Number(n) => n as u32,
            Self::Autovector => IRQ_AUTOVECTOR,
            Self::Spurious => IRQ_SPURIOUS,
        }
    }
}

/// An access that could not be completed; delivered to the CPU as the
/// bus-error exception (vector 2).
#[derive(Debug, Clone, Copy)]
pub struct BusFault {
    pub operation: MemOperation,
    pub address: u32,
    pub width: AccessWidth,
}

/// Request block shared between the framework and the engine.
///
/// Framework code posts requests from inside callbacks; the engine applies
/// them after each callback returns (see the module docs). Outside a
/// quantum the machine applies them itself before the next `execute`.
#[derive(Debug, Default)]
pub struct CpuControl {
    /// Cycles executed so far in the running quantum (engine-maintained).
    pub cycles_into_quantum: u64,
    /// Drive the IRQ input to this level.
    pub irq: Option<u8>,
    /// End the running quantum as soon as possible.
    pub end_timeslice: bool,
    /// End the running quantum once this many cycles of it have run.
    pub shorten_to: Option<u64>,
    /// Deliver a bus-error exception for this access.
    pub bus_error: Option<BusFault>,
}

impl CpuControl {
    /// Post a quantum-shortening request, keeping the nearest target.
    pub fn shorten(&mut self, cycles_into_quantum: u64) {
        self.shorten_to = Some(match self.shorten_to {
            Some(existing) => existing.min(cycles_into_quantum),
            None => cycles_into_quantum,
        });
    }
}

/// Register/memory view handed to `CpuSystem` callbacks.
pub trait CpuAccess {
    fn get_reg(&mut self, reg: CpuRegister) -> u32;
    fn set_reg(&mut self, reg: CpuRegister, value: u32);
    fn read_memory(&mut self, addr: u32, width: AccessWidth) -> u32;
    fn write_memory(&mut self, addr: u32, width: AccessWidth, value: u32);
    fn disassemble(&mut self, pc: u32) -> String;
}

/// Callback surface the engine invokes while executing.
pub trait CpuSystem {
    /// A memory access that decoded to device space. For reads the return
    /// value is the bus result; for writes it is ignored.
    fn device_access(
        &mut self,
        cpu: &mut dyn CpuAccess,
        operation: MemOperation,
        address: u32,
        width: AccessWidth,
        value: u32,
    ) -> u32;

    /// Interrupt-acknowledge cycle for `level`. Returns a vector number,
    /// [`IRQ_AUTOVECTOR`] or [`IRQ_SPURIOUS`].
    fn interrupt_ack(&mut self, cpu: &mut dyn CpuAccess, level: u8) -> u32;

    /// The RESET instruction was executed.
    fn reset_instruction(&mut self, cpu: &mut dyn CpuAccess);

    /// An illegal instruction was fetched. Returning `true` means the
    /// framework consumed it (the engine skips exception processing and
    /// resumes after the opcode); `false` re-raises it as illegal.
    fn illegal_instruction(&mut self, cpu: &mut dyn CpuAccess, opcode: u16) -> bool;

    /// Per-instruction hook, only invoked when instruction tracing is on.
    fn instruction_hook(&mut self, cpu: &mut dyn CpuAccess, pc: u32);

    /// The PC changed non-sequentially (jump, call, return or exception;
    /// `vector` is non-zero for exceptions).
    fn pc_changed(&mut self, cpu: &mut dyn CpuAccess, new_pc: u32, vector: u32);

    /// A RAM/ROM access, only invoked when memory tracing is on.
    fn memory_trace(&mut self, operation: MemOperation, address: u32, width: AccessWidth, value: u32);

    /// The shared request block.
    fn control(&mut self) -> &mut CpuControl;
}

/// The instruction interpreter, driven in cycle quanta.
pub trait CpuEngine {
    fn set_cpu_type(&mut self, cpu_type: CpuType);
    fn init(&mut self);

    /// Assert the reset input: reload SSP/PC from vectors 0/1.
    fn pulse_reset(&mut self);

    /// Run up to `cycles` cycles, delivering callbacks to `system`.
    /// Returns the number actually run (less when the quantum was ended
    /// early).
    fn execute(&mut self, system: &mut dyn CpuSystem, cycles: Cycles) -> Cycles;

    fn set_irq(&mut self, level: u8);
    fn get_reg(&mut self, reg: CpuRegister) -> u32;
    fn set_reg(&mut self, reg: CpuRegister, value: u32);
    fn disassemble(&mut self, pc: u32) -> String;

    /// Declare a RAM/ROM region backing `base..base+size`.
    fn add_memory(&mut self, base: u32, size: u32, writable: bool);

    /// Bulk-load bytes into a previously declared region.
    fn write_bulk(&mut self, base: u32, bytes: &[u8]);

    /// Declare `base..base+size` as device space, dispatched through
    /// [`CpuSystem::device_access`].
    fn add_device_range(&mut self, base: u32, size: u32);

    fn read_memory(&mut self, addr: u32, width: AccessWidth) -> u32;
    fn write_memory(&mut self, addr: u32, width: AccessWidth, value: u32);

    /// Enable delivery of [`CpuSystem::memory_trace`].
    fn set_memory_tracing(&mut self, enable: bool);
    /// Enable delivery of [`CpuSystem::instruction_hook`].
    fn set_instruction_tracing(&mut self, enable: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_codes_match_engine_numbering() {
        assert_eq!(CpuRegister::D0.code(), 0);
        assert_eq!(CpuRegister::A7.code(), 15);
        assert_eq!(CpuRegister::Pc.code(), 16);
        assert_eq!(CpuRegister::Sr.code(), 17);
        assert_eq!(CpuRegister::Ppc.code(), 29);
    }

    #[test]
    fn width_helpers() {
        assert_eq!(AccessWidth::Word.bytes(), 2);
        assert_eq!(AccessWidth::from_bits(32), Some(AccessWidth::Long));
        assert_eq!(AccessWidth::from_bits(12), None);
        assert_eq!(AccessWidth::Byte.truncate(0x1234), 0x34);
    }

    #[test]
    fn vector_raw_encoding() {
        assert_eq!(Vector::Number(0x40).raw(), 0x40);
        assert_eq!(Vector::Autovector.raw(), IRQ_AUTOVECTOR);
        assert_eq!(Vector::Spurious.raw(), IRQ_SPURIOUS);
    }

    #[test]
    fn shorten_keeps_the_nearest_target() {
        let mut control = CpuControl::default();
        control.shorten(500);
        control.shorten(800);
        assert_eq!(control.shorten_to, Some(500));
        control.shorten(100);
        assert_eq!(control.shorten_to, Some(100));
    }
}
