//! Configuration-time errors; all fatal before the CPU runs.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::cpu::AccessWidth;
use format_elf::ElfError;

#[derive(Debug)]
pub enum ConfigError {
    UnknownTarget(String),
    MissingOption { device: String, option: String },
    BadOption { device: String, option: String, value: String },
    /// A device mapped registers without declaring a base address.
    NoBaseAddress { device: String },
    RegisterConflict { register: String, existing: String },
    MisalignedRegister { register: String, address: u32, width: AccessWidth },
    RegionOverlap { base: u32, size: u32 },
    /// A loaded image segment would land outside RAM/ROM or on a device.
    LoadOutsideMemory { address: u32, size: u32 },
    Io { path: PathBuf, source: io::Error },
    Image(ElfError),
    Console(String),
    /// Device-specific configuration failure.
    Device { device: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTarget(name) => write!(f, "unknown target '{name}'"),
            Self::MissingOption { device, option } => {
                write!(f, "device '{device}' requires option '{option}'")
            }
            Self::BadOption { device, option, value } => {
                write!(f, "device '{device}': bad value '{value}' for option '{option}'")
            }
            Self::NoBaseAddress { device } => {
                write!(f, "device '{device}' cannot map registers without a base address")
            }
            Self::RegisterConflict { register, existing } => {
                write!(f, "register {register} conflicts with {existing}")
            }
            Self::MisalignedRegister { register, address, width } => write!(
                f,
                "register {register} at {address:#x} not {}-aligned",
                width.bytes()
            ),
            Self::RegionOverlap { base, size } => {
                write!(f, "region {base:#x}/{size:#x} overlaps an existing mapping")
            }
            Self::LoadOutsideMemory { address, size } => {
                write!(f, "image segment {address:#x}/{size:#x} lands outside mapped memory")
            }
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Image(err) => write!(f, "image: {err}"),
            Self::Console(msg) => write!(f, "console: {msg}"),
            Self::Device { device, message } => write!(f, "device '{device}': {message}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Image(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ElfError> for ConfigError {
    fn from(err: ElfError) -> Self {
        Self::Image(err)
    }
}
