//! Command-line argument parsing.

use std::path::PathBuf;
use std::process;

#[derive(Debug, Clone)]
pub struct Args {
    pub target: Option<String>,
    pub list_targets: bool,
    pub cycle_limit: Option<u64>,
    pub load: Option<PathBuf>,
    pub load_address: u32,
    pub disable_bus_error: bool,
    pub trace_file: PathBuf,
    pub trace_memory: bool,
    pub trace_instructions: bool,
    pub trace_jumps: bool,
    pub trace_io: bool,
    pub trace_everything: bool,
    pub symbols: Vec<PathBuf>,
    pub debug_devices: Vec<String>,
    pub stdout_console: bool,
    pub memory_size_kib: Option<u32>,
    pub diskfile: Option<String>,
    pub duart_console_port: Option<String>,
    pub rom: Option<PathBuf>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            target: None,
            list_targets: false,
            cycle_limit: None,
            load: None,
            load_address: 0,
            disable_bus_error: false,
            trace_file: PathBuf::from("trace.out"),
            trace_memory: false,
            trace_instructions: false,
            trace_jumps: false,
            trace_io: false,
            trace_everything: false,
            symbols: Vec::new(),
            debug_devices: Vec::new(),
            stdout_console: false,
            memory_size_kib: None,
            diskfile: None,
            duart_console_port: None,
            rom: None,
        }
    }
}

fn number(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn usage() -> ! {
    eprintln!("Usage: sim68k --target NAME [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --target NAME          target system to emulate");
    eprintln!("  --list-targets         list the available targets");
    eprintln!("  --cycle-limit N        stop after N machine cycles");
    eprintln!("  --load PATH            ELF executable to load");
    eprintln!("  --load-address N       load/relocation base address [default: 0]");
    eprintln!("  --disable-bus-error    unmapped accesses read as open bus");
    eprintln!("  --memory-size KIB      override target RAM size");
    eprintln!("  --trace-file PATH      trace output file [default: trace.out]");
    eprintln!("  --trace-memory         enable memory tracing at startup");
    eprintln!("  --trace-instructions   enable instruction tracing at startup");
    eprintln!("  --trace-jumps          enable branch tracing at startup");
    eprintln!("  --trace-io             enable device register tracing");
    eprintln!("  --trace-everything     enable all tracing options");
    eprintln!("  --symbols PATH         add an ELF symbol file (repeatable)");
    eprintln!("  --debug-device NAME    framework debug for NAME (repeatable)");
    eprintln!("  --stdout-console       console output to stdout, no input");
    eprintln!("  --diskfile PATH        disk image file for disk-like devices");
    eprintln!("  --duart-console-port P DUART console routing: A, B or none");
    eprintln!("  --rom PATH             ROM image for targets with ROM");
    process::exit(0);
}

pub fn parse_args() -> Args {
    parse_from(std::env::args().skip(1))
}

fn bail(message: &str) -> ! {
    eprintln!("{message}");
    process::exit(1);
}

pub fn parse_from(args: impl Iterator<Item = String>) -> Args {
    let argv: Vec<String> = args.collect();
    let mut out = Args::default();

    let mut i = 0;
    let value = |i: &mut usize| -> String {
        *i += 1;
        match argv.get(*i) {
            Some(v) => v.clone(),
            None => bail(&format!("missing value for {}", argv[*i - 1])),
        }
    };

    while i < argv.len() {
        match argv[i].as_str() {
            "--target" => out.target = Some(value(&mut i)),
            "--list-targets" => out.list_targets = true,
            "--cycle-limit" => {
                let v = value(&mut i);
                out.cycle_limit =
                    Some(number(&v).unwrap_or_else(|| bail(&format!("bad cycle limit '{v}'"))));
            }
            "--load" => out.load = Some(PathBuf::from(value(&mut i))),
            "--load-address" => {
                let v = value(&mut i);
                out.load_address =
                    number(&v).unwrap_or_else(|| bail(&format!("bad load address '{v}'"))) as u32;
            }
            "--disable-bus-error" => out.disable_bus_error = true,
            "--memory-size" => {
                let v = value(&mut i);
                out.memory_size_kib =
                    Some(number(&v).unwrap_or_else(|| bail(&format!("bad memory size '{v}'"))) as u32);
            }
            "--trace-file" => out.trace_file = PathBuf::from(value(&mut i)),
            "--trace-memory" => out.trace_memory = true,
            "--trace-instructions" => out.trace_instructions = true,
            "--trace-jumps" => out.trace_jumps = true,
            "--trace-io" => out.trace_io = true,
            "--trace-everything" => out.trace_everything = true,
            "--symbols" => out.symbols.push(PathBuf::from(value(&mut i))),
            "--debug-device" => out.debug_devices.push(value(&mut i)),
            "--stdout-console" => out.stdout_console = true,
            "--diskfile" => out.diskfile = Some(value(&mut i)),
            "--duart-console-port" => out.duart_console_port = Some(value(&mut i)),
            "--rom" => out.rom = Some(PathBuf::from(value(&mut i))),
            "--help" | "-h" => usage(),
            other => bail(&format!("unknown argument: {other}")),
        }
        i += 1;
    }

    if out.target.is_some() && out.list_targets {
        bail("--target and --list-targets are mutually exclusive");
    }
    out
}
