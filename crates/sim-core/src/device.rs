//! Device model contract.
//!
//! A device is a small capability set: reset to power-on state, service
//! register reads and writes, run named scheduled callbacks, and answer
//! interrupt acknowledges. The machine owns every device and addresses it
//! by index; devices reach framework services only through the context
//! value passed into each call.

use std::collections::HashMap;
use std::fmt;

use crate::cpu::{AccessWidth, Vector};
use crate::error::ConfigError;
use crate::machine::MachineContext;

/// Index of a device in the machine's registry, in registration order.
pub type DeviceId = usize;

/// A runtime failure inside a device handler. Captured into the machine's
/// fatal flag together with the device name; ends the run.
#[derive(Debug)]
pub struct DeviceFault {
    pub message: String,
}

impl DeviceFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DeviceFault {}

impl From<std::io::Error> for DeviceFault {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

pub type DeviceResult<T = ()> = Result<T, DeviceFault>;

/// A peripheral model plugged into the machine.
pub trait Device {
    /// Return the device to power-on state. Runs at startup and on every
    /// CPU reset, in registration order; must be idempotent.
    fn reset(&mut self, ctx: &mut MachineContext<'_>) -> DeviceResult;

    /// A CPU read decoded to one of this device's registers.
    /// `offset` is relative to the device base address.
    fn read(&mut self, ctx: &mut MachineContext<'_>, width: AccessWidth, offset: u32) -> DeviceResult<u32> {
        let _ = (ctx, width, offset);
        Ok(0)
    }

    /// A CPU write decoded to one of this device's registers.
    fn write(
        &mut self,
        ctx: &mut MachineContext<'_>,
        width: AccessWidth,
        offset: u32,
        value: u32,
    ) -> DeviceResult {
        let _ = (ctx, width, offset, value);
        Ok(())
    }

    /// A scheduled callback registered under `name` came due.
    fn callback(&mut self, ctx: &mut MachineContext<'_>, name: &'static str) -> DeviceResult {
        let _ = (ctx, name);
        Ok(())
    }

    /// Interrupt-acknowledge for `level`. Only called on devices whose
    /// asserted IPL equals the acknowledged level.
    fn get_vector(&mut self, ctx: &mut MachineContext<'_>, level: u8) -> Vector {
        let _ = (ctx, level);
        Vector::Spurious
    }

    /// Console input arrived (only on the registered input device).
    fn console_input(&mut self, ctx: &mut MachineContext<'_>, bytes: &[u8]) -> DeviceResult {
        let _ = (ctx, bytes);
        Ok(())
    }
}

/// Configuration bundle handed to a device constructor.
///
/// `address` and `interrupt` are understood by the framework itself;
/// anything else is a device-specific string option (e.g. `diskfile`).
#[derive(Debug, Default, Clone)]
pub struct DeviceOptions {
    pub address: Option<u32>,
    pub interrupt: Option<u8>,
    extras: HashMap<String, String>,
}

impl DeviceOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn address(mut self, address: u32) -> Self {
        self.address = Some(address);
        self
    }

    #[must_use]
    pub fn interrupt(mut self, ipl: u8) -> Self {
        self.interrupt = Some(ipl);
        self
    }

    #[must_use]
    pub fn option(mut self, name: &str, value: impl Into<String>) -> Self {
        self.extras.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.extras.get(name).map(String::as_str)
    }

    /// Fetch a required base address or fail with the device name.
    pub fn require_address(&self, device: &str) -> Result<u32, ConfigError> {
        self.address.ok_or_else(|| ConfigError::MissingOption {
            device: device.to_string(),
            option: "address".to_string(),
        })
    }

    /// Fetch a required interrupt assignment or fail with the device name.
    pub fn require_interrupt(&self, device: &str) -> Result<u8, ConfigError> {
        self.interrupt.ok_or_else(|| ConfigError::MissingOption {
            device: device.to_string(),
            option: "interrupt".to_string(),
        })
    }

    /// Fetch a required device-specific option or fail with the device name.
    pub fn require(&self, device: &str, name: &str) -> Result<&str, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::MissingOption {
            device: device.to_string(),
            option: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_options_name_the_device() {
        let opts = DeviceOptions::new().address(0xFF0000);
        assert_eq!(opts.require_address("uart").expect("present"), 0xFF0000);
        let err = opts.require_interrupt("uart").expect_err("missing");
        assert!(err.to_string().contains("uart"));
        assert!(err.to_string().contains("interrupt"));
    }

    #[test]
    fn extra_options_round_trip() {
        let opts = DeviceOptions::new().option("diskfile", "/tmp/cf.img");
        assert_eq!(opts.get("diskfile"), Some("/tmp/cf.img"));
        assert_eq!(opts.get("missing"), None);
        assert!(opts.require("disk", "missing").is_err());
    }
}
