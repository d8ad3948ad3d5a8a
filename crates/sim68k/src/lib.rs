//! Board emulator built on the device framework: target configurations,
//! board devices and the command-line surface.

pub mod cli;
pub mod devices;
pub mod signal;
pub mod targets;
