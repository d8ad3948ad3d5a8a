//! Musashi CPU engine binding.
//!
//! Wraps the native interpreter (plus its memory shim) behind
//! [`sim_core::CpuEngine`]. The native API is process-global with C
//! callback pointers, so the binding keeps a thread-local pointer to the
//! active [`CpuSystem`] for the duration of each `execute` call and
//! forwards the C callbacks through it. Per the engine contract, every
//! trampoline syncs the cycles-run count before the callback and applies
//! posted control requests after it.
//!
//! Link against `libmusashi` (the interpreter built together with the
//! memory shim). The runner enables this crate through its `musashi`
//! feature so that hosts without the native library can still build and
//! test everything else.

// FFI binding: the one crate in the workspace that needs unsafe.
#![allow(unsafe_code)]

use std::cell::Cell;
use std::ffi::{c_char, c_int, c_uint};

use sim_core::{
    AccessWidth, CpuAccess, CpuControl, CpuEngine, CpuRegister, CpuSystem, CpuType, Cycles,
    MemOperation, IRQ_SPURIOUS,
};

/// Memory-shim operation codes.
const MEM_READ: c_int = b'R' as c_int;
const MEM_WRITE: c_int = b'W' as c_int;
const MEM_FETCH: c_int = b'I' as c_int;

#[link(name = "musashi")]
unsafe extern "C" {
    fn m68k_init();
    fn m68k_set_cpu_type(cpu_type: c_uint);
    fn m68k_pulse_reset();
    fn m68k_execute(cycles: c_int) -> c_int;
    fn m68k_cycles_run() -> c_int;
    fn m68k_cycles_remaining() -> c_int;
    fn m68k_modify_timeslice(cycles: c_int);
    fn m68k_end_timeslice();
    fn m68k_set_irq(level: c_uint);
    fn m68k_get_reg(context: *mut core::ffi::c_void, reg: c_int) -> c_uint;
    fn m68k_set_reg(reg: c_int, value: c_uint);
    fn m68k_disassemble(buf: *mut c_char, pc: c_uint, cpu_type: c_uint) -> c_int;
    fn m68k_pulse_bus_error();

    fn m68k_set_int_ack_callback(callback: extern "C" fn(c_int) -> c_uint);
    fn m68k_set_reset_instr_callback(callback: extern "C" fn());
    fn m68k_set_illg_instr_callback(callback: extern "C" fn(c_int) -> c_int);
    fn m68k_set_instr_hook_callback(callback: extern "C" fn());
    fn m68k_set_pc_changed_callback(callback: extern "C" fn(c_uint, c_uint));

    fn mem_add_memory(base: c_uint, size: c_uint, writable: c_int) -> c_int;
    fn mem_add_device(base: c_uint, size: c_uint) -> c_int;
    fn mem_write_bulk(base: c_uint, bytes: *const u8, len: c_uint);
    fn mem_read_memory(addr: c_uint, size: c_int) -> c_uint;
    fn mem_write_memory(addr: c_uint, size: c_int, value: c_uint);
    fn mem_set_device_handler(
        callback: extern "C" fn(c_int, c_uint, c_int, c_uint) -> c_uint,
    );
    fn mem_set_trace_handler(callback: extern "C" fn(c_int, c_uint, c_int, c_uint) -> c_int);
    fn mem_enable_mem_tracing(enable: c_int);
    fn mem_enable_instr_tracing(enable: c_int);
}

thread_local! {
    /// The system receiving callbacks for the `execute` call in progress.
    static ACTIVE: Cell<Option<*mut dyn CpuSystem>> = const { Cell::new(None) };
}

/// Run `f` against the active system; `fallback` when no quantum runs
/// (spurious native callback outside `execute`).
fn with_active<R>(fallback: R, f: impl FnOnce(&mut dyn CpuSystem) -> R) -> R {
    ACTIVE.with(|active| match active.get() {
        // Valid for the duration of execute(); see ActiveGuard.
        Some(ptr) => f(unsafe { &mut *ptr }),
        None => fallback,
    })
}

struct ActiveGuard;

impl ActiveGuard {
    fn install(system: &mut dyn CpuSystem) -> Self {
        let ptr: *mut dyn CpuSystem = system;
        // Erase the lifetime for thread-local storage; the guard clears the
        // pointer before the borrow ends.
        ACTIVE.with(|active| active.set(Some(unsafe { core::mem::transmute(ptr) })));
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(None));
    }
}

fn width_from_code(code: c_int) -> AccessWidth {
    match code {
        8 => AccessWidth::Byte,
        16 => AccessWidth::Word,
        _ => AccessWidth::Long,
    }
}

/// Sync cycles into the control block before a callback.
fn sync_control(system: &mut dyn CpuSystem) {
    let run = unsafe { m68k_cycles_run() };
    system.control().cycles_into_quantum = run.max(0) as u64;
}

/// Apply and clear requests posted during a callback.
fn apply_control(control: &mut CpuControl) {
    if let Some(level) = control.irq.take() {
        unsafe { m68k_set_irq(c_uint::from(level)) };
    }
    if let Some(target) = control.shorten_to.take() {
        let run = unsafe { m68k_cycles_run() }.max(0) as u64;
        let remaining = unsafe { m68k_cycles_remaining() }.max(0) as u64;
        let want_remaining = target.saturating_sub(run);
        if want_remaining < remaining {
            let cut = remaining - want_remaining;
            unsafe { m68k_modify_timeslice(-(cut.min(c_int::MAX as u64) as c_int)) };
        }
    }
    if control.bus_error.take().is_some() {
        unsafe { m68k_pulse_bus_error() };
    }
    if control.end_timeslice {
        control.end_timeslice = false;
        unsafe { m68k_end_timeslice() };
    }
}

fn finish_callback(system: &mut dyn CpuSystem) {
    apply_control(system.control());
}

/// Register/memory view over the native API; valid whenever the
/// interpreter is live, which is all a callback can observe.
struct MusashiView;

impl CpuAccess for MusashiView {
    fn get_reg(&mut self, reg: CpuRegister) -> u32 {
        unsafe { m68k_get_reg(core::ptr::null_mut(), reg.code() as c_int) }
    }

    fn set_reg(&mut self, reg: CpuRegister, value: u32) {
        unsafe { m68k_set_reg(reg.code() as c_int, value) };
    }

    fn read_memory(&mut self, addr: u32, width: AccessWidth) -> u32 {
        unsafe { mem_read_memory(addr, width.bits() as c_int) }
    }

    fn write_memory(&mut self, addr: u32, width: AccessWidth, value: u32) {
        unsafe { mem_write_memory(addr, width.bits() as c_int, value) };
    }

    fn disassemble(&mut self, pc: u32) -> String {
        disassemble_at(pc)
    }
}

fn disassemble_at(pc: u32) -> String {
    let mut buf = [0u8; 100];
    unsafe {
        m68k_disassemble(buf.as_mut_ptr().cast::<c_char>(), pc, CURRENT_CPU_TYPE.get());
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

thread_local! {
    static CURRENT_CPU_TYPE: Cell<c_uint> = const { Cell::new(1) };
}

extern "C" fn device_handler(operation: c_int, address: c_uint, width: c_int, value: c_uint) -> c_uint {
    with_active(0, |system| {
        sync_control(system);
        let op = if operation == MEM_WRITE { MemOperation::Write } else { MemOperation::Read };
        let result =
            system.device_access(&mut MusashiView, op, address, width_from_code(width), value);
        finish_callback(system);
        result
    })
}

extern "C" fn int_ack_handler(level: c_int) -> c_uint {
    with_active(IRQ_SPURIOUS, |system| {
        sync_control(system);
        let vector = system.interrupt_ack(&mut MusashiView, level.clamp(0, 7) as u8);
        finish_callback(system);
        vector
    })
}

extern "C" fn reset_instr_handler() {
    with_active((), |system| {
        sync_control(system);
        system.reset_instruction(&mut MusashiView);
        finish_callback(system);
    });
}

extern "C" fn illg_instr_handler(opcode: c_int) -> c_int {
    with_active(0, |system| {
        sync_control(system);
        let handled = system.illegal_instruction(&mut MusashiView, opcode as u16);
        finish_callback(system);
        c_int::from(handled)
    })
}

extern "C" fn instr_hook_handler() {
    with_active((), |system| {
        sync_control(system);
        let pc = MusashiView.get_reg(CpuRegister::Pc);
        system.instruction_hook(&mut MusashiView, pc);
        finish_callback(system);
    });
}

extern "C" fn pc_changed_handler(new_pc: c_uint, vector: c_uint) {
    with_active((), |system| {
        sync_control(system);
        system.pc_changed(&mut MusashiView, new_pc, vector);
        finish_callback(system);
    });
}

extern "C" fn trace_handler(operation: c_int, address: c_uint, width: c_int, value: c_uint) -> c_int {
    if operation == MEM_FETCH {
        // immediate fetches are covered by instruction tracing
        return 0;
    }
    with_active(0, |system| {
        let op = if operation == MEM_WRITE { MemOperation::Write } else { MemOperation::Read };
        system.memory_trace(op, address, width_from_code(width), value);
        0
    })
}

/// The native interpreter as a [`CpuEngine`].
///
/// The native state is process-global, so at most one instance makes
/// sense per process; the framework owns exactly one.
pub struct MusashiCpu {
    cpu_type: CpuType,
}

impl MusashiCpu {
    #[must_use]
    pub fn new() -> Self {
        Self { cpu_type: CpuType::M68000 }
    }
}

impl Default for MusashiCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuEngine for MusashiCpu {
    fn set_cpu_type(&mut self, cpu_type: CpuType) {
        self.cpu_type = cpu_type;
        CURRENT_CPU_TYPE.with(|t| t.set(cpu_type.code()));
        unsafe { m68k_set_cpu_type(cpu_type.code()) };
    }

    fn init(&mut self) {
        unsafe {
            m68k_init();
            m68k_set_int_ack_callback(int_ack_handler);
            m68k_set_reset_instr_callback(reset_instr_handler);
            m68k_set_illg_instr_callback(illg_instr_handler);
            m68k_set_pc_changed_callback(pc_changed_handler);
            mem_set_device_handler(device_handler);
            mem_set_trace_handler(trace_handler);
        }
    }

    fn pulse_reset(&mut self) {
        unsafe { m68k_pulse_reset() };
    }

    fn execute(&mut self, system: &mut dyn CpuSystem, cycles: Cycles) -> Cycles {
        let _guard = ActiveGuard::install(system);
        let capped = cycles.get().min(c_int::MAX as u64) as c_int;
        let ran = unsafe { m68k_execute(capped) };
        Cycles::new(ran.max(0) as u64)
    }

    fn set_irq(&mut self, level: u8) {
        unsafe { m68k_set_irq(c_uint::from(level)) };
    }

    fn get_reg(&mut self, reg: CpuRegister) -> u32 {
        unsafe { m68k_get_reg(core::ptr::null_mut(), reg.code() as c_int) }
    }

    fn set_reg(&mut self, reg: CpuRegister, value: u32) {
        unsafe { m68k_set_reg(reg.code() as c_int, value) };
    }

    fn disassemble(&mut self, pc: u32) -> String {
        disassemble_at(pc)
    }

    fn add_memory(&mut self, base: u32, size: u32, writable: bool) {
        unsafe { mem_add_memory(base, size, c_int::from(writable)) };
    }

    fn write_bulk(&mut self, base: u32, bytes: &[u8]) {
        unsafe { mem_write_bulk(base, bytes.as_ptr(), bytes.len() as c_uint) };
    }

    fn add_device_range(&mut self, base: u32, size: u32) {
        unsafe { mem_add_device(base, size) };
    }

    fn read_memory(&mut self, addr: u32, width: AccessWidth) -> u32 {
        unsafe { mem_read_memory(addr, width.bits() as c_int) }
    }

    fn write_memory(&mut self, addr: u32, width: AccessWidth, value: u32) {
        unsafe { mem_write_memory(addr, width.bits() as c_int, value) };
    }

    fn set_memory_tracing(&mut self, enable: bool) {
        unsafe { mem_enable_mem_tracing(c_int::from(enable)) };
    }

    fn set_instruction_tracing(&mut self, enable: bool) {
        unsafe {
            mem_enable_instr_tracing(c_int::from(enable));
            if enable {
                m68k_set_instr_hook_callback(instr_hook_handler);
            }
        }
    }
}
