//! Simple board disk.
//!
//! Sector/count/command/data register protocol over a sector-aligned
//! image file. Data moves 32 bits at a time, big-endian, while the
//! status register reports data-ready.

use std::io::{Read, Seek, SeekFrom, Write};

use sim_core::{
    AccessWidth, ConfigError, Device, DeviceFault, DeviceResult, DeviceSetup, MachineContext,
    RegisterDef,
};

pub const SECTOR_SIZE: u32 = 512;

pub const CMD_READ: u32 = 0x01;
pub const CMD_WRITE: u32 = 0x02;

pub const STATUS_IDLE: u32 = 0x00;
pub const STATUS_NOT_READY: u32 = 0x01;
pub const STATUS_ERROR: u32 = 0x02;
pub const STATUS_DATA_READY: u32 = 0x03;

const REG_SECTOR: u32 = 0x00;
const REG_SIZE: u32 = 0x04; // COUNT on write
const REG_STATUS: u32 = 0x08; // COMMAND on write
const REG_DATA: u32 = 0x0C;

/// Sector-addressed backing store.
pub trait Backing: Read + Write + Seek {}

impl<T: Read + Write + Seek> Backing for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Read,
    Write,
}

pub struct Disk {
    backing: Option<Box<dyn Backing>>,
    total_sectors: u32,
    status: u32,
    sector: u32,
    count: u32,
    mode: Mode,
    bytes_remaining: u32,
}

impl Disk {
    pub const REGISTERS: &'static [RegisterDef] = &[
        RegisterDef::read("SIZE", REG_SIZE, AccessWidth::Long),
        RegisterDef::read("STATUS", REG_STATUS, AccessWidth::Long),
        RegisterDef::read("DATA", REG_DATA, AccessWidth::Long),
        RegisterDef::write("SECTOR", REG_SECTOR, AccessWidth::Long),
        RegisterDef::write("COUNT", REG_SIZE, AccessWidth::Long),
        RegisterDef::write("COMMAND", REG_STATUS, AccessWidth::Long),
        RegisterDef::write("DATA", REG_DATA, AccessWidth::Long),
    ];

    /// Options: `address` required, `diskfile` optional (the device
    /// reports not-ready without one).
    pub fn new(setup: &mut DeviceSetup<'_>) -> Result<Self, ConfigError> {
        setup.options().require_address(setup.name())?;
        setup.add_registers(Self::REGISTERS)?;
        match setup.options().get("diskfile") {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|source| ConfigError::Io { path: path.into(), source })?;
                let size = file
                    .metadata()
                    .map_err(|source| ConfigError::Io { path: path.into(), source })?
                    .len();
                if size % u64::from(SECTOR_SIZE) != 0 {
                    return Err(ConfigError::Device {
                        device: setup.name().to_string(),
                        message: format!(
                            "disk file {path} size {size} is not a multiple of {SECTOR_SIZE}"
                        ),
                    });
                }
                Ok(Self::from_parts(
                    Some(Box::new(file)),
                    (size / u64::from(SECTOR_SIZE)) as u32,
                ))
            }
            None => Ok(Self::from_parts(None, 0)),
        }
    }

    /// Build over an arbitrary backing store (tests).
    pub fn with_backing(
        setup: &mut DeviceSetup<'_>,
        mut backing: Box<dyn Backing>,
    ) -> Result<Self, ConfigError> {
        setup.options().require_address(setup.name())?;
        setup.add_registers(Self::REGISTERS)?;
        let size = backing.seek(SeekFrom::End(0)).map_err(|e| ConfigError::Device {
            device: setup.name().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::from_parts(Some(backing), (size / u64::from(SECTOR_SIZE)) as u32))
    }

    fn from_parts(backing: Option<Box<dyn Backing>>, total_sectors: u32) -> Self {
        let status = if backing.is_some() { STATUS_IDLE } else { STATUS_NOT_READY };
        Self {
            backing,
            total_sectors,
            status,
            sector: 0,
            count: 0,
            mode: Mode::Idle,
            bytes_remaining: 0,
        }
    }

    fn command(&mut self, ctx: &mut MachineContext<'_>, value: u32) -> DeviceResult {
        self.mode = Mode::Idle;
        self.bytes_remaining = 0;

        match value {
            CMD_READ => {
                ctx.trace(&format!("read {:#x}/{}", self.sector, self.count));
                self.mode = Mode::Read;
            }
            CMD_WRITE => {
                ctx.trace(&format!("write {:#x}/{}", self.sector, self.count));
                self.mode = Mode::Write;
            }
            _ => {
                ctx.trace(&format!("bad cmd {value}"));
                self.status = STATUS_ERROR;
                return Ok(());
            }
        }

        if self.count == 0
            || self.count > self.total_sectors
            || self.total_sectors - self.count < self.sector
        {
            ctx.trace("access beyond end of device");
            self.status = STATUS_ERROR;
            return Ok(());
        }

        let backing = self.backing.as_mut().ok_or_else(|| DeviceFault::new("no backing store"))?;
        backing.seek(SeekFrom::Start(u64::from(self.sector) * u64::from(SECTOR_SIZE)))?;
        self.bytes_remaining = self.count * SECTOR_SIZE;
        self.status = STATUS_DATA_READY;
        Ok(())
    }

    fn data_read(&mut self, ctx: &mut MachineContext<'_>) -> DeviceResult<u32> {
        if self.mode != Mode::Read || self.bytes_remaining == 0 {
            ctx.trace("read overrun");
            self.status = STATUS_ERROR;
            return Ok(0);
        }
        let backing = self.backing.as_mut().ok_or_else(|| DeviceFault::new("no backing store"))?;
        let mut buf = [0u8; 4];
        backing.read_exact(&mut buf)?;
        self.bytes_remaining -= 4;
        if self.bytes_remaining == 0 {
            self.status = STATUS_IDLE;
        }
        Ok(u32::from_be_bytes(buf))
    }

    fn data_write(&mut self, ctx: &mut MachineContext<'_>, value: u32) -> DeviceResult {
        if self.mode != Mode::Write || self.bytes_remaining == 0 {
            ctx.trace("write overrun");
            self.status = STATUS_ERROR;
            return Ok(());
        }
        let backing = self.backing.as_mut().ok_or_else(|| DeviceFault::new("no backing store"))?;
        backing.write_all(&value.to_be_bytes())?;
        self.bytes_remaining -= 4;
        if self.bytes_remaining == 0 {
            self.status = STATUS_IDLE;
            backing.flush()?;
        }
        Ok(())
    }
}

impl Device for Disk {
    fn reset(&mut self, _ctx: &mut MachineContext<'_>) -> DeviceResult {
        self.status = if self.backing.is_some() { STATUS_IDLE } else { STATUS_NOT_READY };
        self.sector = 0;
        self.count = 0;
        self.mode = Mode::Idle;
        self.bytes_remaining = 0;
        Ok(())
    }

    fn read(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32) -> DeviceResult<u32> {
        match offset {
            REG_SIZE => Ok(self.total_sectors),
            REG_STATUS => Ok(self.status),
            REG_DATA => self.data_read(ctx),
            _ => Ok(0),
        }
    }

    fn write(&mut self, ctx: &mut MachineContext<'_>, _width: AccessWidth, offset: u32, value: u32) -> DeviceResult {
        match offset {
            REG_SECTOR => {
                self.sector = value;
                Ok(())
            }
            REG_SIZE => {
                self.count = value;
                Ok(())
            }
            REG_STATUS => self.command(ctx, value),
            REG_DATA => self.data_write(ctx, value),
            _ => Ok(()),
        }
    }
}
