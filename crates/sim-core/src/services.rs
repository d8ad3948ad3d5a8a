//! Host-services ABI ("native features").
//!
//! Two reserved illegal-instruction encodings give guest programs a call
//! gate into the host, following the established native-features
//! convention so existing binaries keep working: one opcode resolves a
//! service name to an id, the other invokes a service by id. Arguments
//! live on the guest stack; results come back in D0.

use crate::cpu::{AccessWidth, CpuAccess, CpuRegister};
use crate::machine::{ExitReason, Shared};

/// Identify: `(SP)` points at a NUL-terminated service name; D0 gets the
/// service id, 0 if unknown.
pub const OP_IDENTIFY: u16 = 0x7300;
/// Invoke: `(SP)` holds `id << 16 | function code`, `4(SP)` onward the
/// argument block; D0 gets the result.
pub const OP_INVOKE: u16 = 0x7301;

/// Result sentinel for unknown ids/codes; the instruction is then
/// re-raised as illegal.
pub const ERR_SENTINEL: u32 = 0xFFFF_FFFF;

/// Framework version reported by `NF_VERSION` (major << 16 | minor).
pub const VERSION: u32 = 0x0001_0000;

const ID_VERSION: u32 = 1;
const ID_STDERR: u32 = 2;
const ID_SHUTDOWN: u32 = 3;
const ID_TRACE: u32 = 4;

const TRACE_STOP: u32 = 0;
const TRACE_START: u32 = 1;
const TRACE_LIMIT: u32 = 2;

const TRACE_MEMORY: u32 = 0x01;
const TRACE_INSTRUCTIONS: u32 = 0x02;
const TRACE_JUMPS: u32 = 0x04;
const TRACE_IO: u32 = 0x08;
const TRACE_EXCEPTIONS: u32 = 0x10;

/// Longest service name / stderr buffer we will walk in guest memory.
const STRING_LIMIT: u32 = 256;

/// Dispatch one reserved opcode. Returns false when the opcode is not
/// ours or the call is unknown, re-raising the illegal instruction.
pub(crate) fn handle(shared: &mut Shared, cpu: &mut dyn CpuAccess, opcode: u16) -> bool {
    match opcode {
        OP_IDENTIFY => {
            let ptr = stack_arg(cpu, 0);
            let name = read_string(cpu, ptr);
            let id = match name.as_str() {
                "NF_VERSION" => ID_VERSION,
                "NF_STDERR" => ID_STDERR,
                "NF_SHUTDOWN" => ID_SHUTDOWN,
                "NF_TRACE" => ID_TRACE,
                _ => 0,
            };
            shared
                .trace
                .line("SERVICE", None, &format!("identify '{name}' -> {id}"));
            cpu.set_reg(CpuRegister::D0, id);
            true
        }
        OP_INVOKE => invoke(shared, cpu),
        _ => false,
    }
}

fn invoke(shared: &mut Shared, cpu: &mut dyn CpuAccess) -> bool {
    let word = stack_arg(cpu, 0);
    let id = word >> 16;
    let code = word & 0xFFFF;
    match id {
        ID_VERSION => {
            cpu.set_reg(CpuRegister::D0, VERSION);
            true
        }
        ID_STDERR => match code {
            // write a NUL-terminated buffer
            0 => {
                let ptr = stack_arg(cpu, 4);
                let text = read_string(cpu, ptr);
                eprint!("{text}");
                cpu.set_reg(CpuRegister::D0, text.len() as u32);
                true
            }
            // write one byte
            1 => {
                let byte = stack_arg(cpu, 4) & 0xFF;
                eprint!("{}", char::from(byte as u8));
                cpu.set_reg(CpuRegister::D0, 1);
                true
            }
            _ => {
                cpu.set_reg(CpuRegister::D0, ERR_SENTINEL);
                false
            }
        },
        ID_SHUTDOWN => {
            shared.trace.line("SERVICE", None, "shutdown");
            shared.request_exit(ExitReason::Shutdown);
            cpu.set_reg(CpuRegister::D0, 0);
            true
        }
        ID_TRACE => match code {
            TRACE_STOP => {
                shared.trace.enable("everything", false);
                cpu.set_reg(CpuRegister::D0, 0);
                true
            }
            TRACE_START => {
                let mask = stack_arg(cpu, 4);
                let categories = shared.trace.categories_mut();
                categories.memory |= mask & TRACE_MEMORY != 0;
                categories.instructions |= mask & TRACE_INSTRUCTIONS != 0;
                categories.jumps |= mask & TRACE_JUMPS != 0;
                categories.io |= mask & TRACE_IO != 0;
                categories.exceptions |= mask & TRACE_EXCEPTIONS != 0;
                cpu.set_reg(CpuRegister::D0, 0);
                true
            }
            TRACE_LIMIT => {
                let cycles = stack_arg(cpu, 4);
                shared.trace_limit = Some(shared.current_cycle() + crate::clock::Cycles::new(u64::from(cycles)));
                cpu.set_reg(CpuRegister::D0, 0);
                true
            }
            _ => {
                cpu.set_reg(CpuRegister::D0, ERR_SENTINEL);
                false
            }
        },
        _ => {
            cpu.set_reg(CpuRegister::D0, ERR_SENTINEL);
            false
        }
    }
}

fn stack_arg(cpu: &mut dyn CpuAccess, offset: u32) -> u32 {
    let sp = cpu.get_reg(CpuRegister::Sp);
    cpu.read_memory(sp.wrapping_add(offset), AccessWidth::Long)
}

fn read_string(cpu: &mut dyn CpuAccess, mut addr: u32) -> String {
    let mut out = Vec::new();
    for _ in 0..STRING_LIMIT {
        let byte = cpu.read_memory(addr, AccessWidth::Byte) as u8;
        if byte == 0 {
            break;
        }
        out.push(byte);
        addr = addr.wrapping_add(1);
    }
    String::from_utf8_lossy(&out).into_owned()
}
