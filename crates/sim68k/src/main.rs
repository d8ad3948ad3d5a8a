//! Emulator entry point.

use std::process;

use sim_core::{ConfigError, CpuEngine, Machine, SocketConsole, StdoutConsole};

use sim68k::cli::{parse_args, Args};
use sim68k::signal;
use sim68k::targets;

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let args = parse_args();

    if args.list_targets {
        for (name, description) in targets::TARGETS {
            println!("{name:10} {description}");
        }
        return 0;
    }

    let Some(target) = args.target.clone() else {
        eprintln!("one of --target or --list-targets is required");
        return 1;
    };

    launch(&target, &args)
}

#[cfg(feature = "musashi")]
fn launch(target: &str, args: &Args) -> i32 {
    match configure(target, cpu_musashi::MusashiCpu::new(), args) {
        Ok(mut machine) => {
            let reason = machine.run();
            println!("terminating: {reason}");
            i32::from(!reason.is_clean())
        }
        Err(err) => {
            println!("{err}");
            1
        }
    }
}

#[cfg(not(feature = "musashi"))]
fn launch(_target: &str, _args: &Args) -> i32 {
    eprintln!("built without the native CPU engine; rebuild with --features musashi");
    2
}

/// Build, load and wire a machine for the chosen target.
#[cfg_attr(not(feature = "musashi"), allow(dead_code))]
fn configure<E: CpuEngine>(target: &str, cpu: E, args: &Args) -> Result<Machine<E>, ConfigError> {
    let mut machine = targets::configure(target, cpu, args)?;

    if let Some(path) = &args.load {
        machine.load_image_file(path, args.load_address)?;
    }
    for path in &args.symbols {
        machine.add_symbols_file(path)?;
    }

    if args.stdout_console {
        machine.add_console(Box::new(StdoutConsole));
    } else {
        machine.add_console(Box::new(SocketConsole::connect()?));
    }

    machine.set_interrupt_flag(signal::install());
    Ok(machine)
}
