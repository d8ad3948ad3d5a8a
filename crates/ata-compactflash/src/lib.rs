//! Memory-mapped CompactFlash emulation (ATA true-IDE register file).
//!
//! Backed by a sector-addressed store, normally a disk image file whose
//! size must be a whole number of 512-byte sectors. Supports READ
//! SECTORS, WRITE SECTORS and IDENTIFY DEVICE in LBA mode; data moves
//! through the 8/16-bit data registers while DRQ is up.
//!
//! Reference: CF+ / CompactFlash specification register model.

use std::io::{Read, Seek, SeekFrom, Write};

use sim_core::{
    AccessWidth, ConfigError, Device, DeviceFault, DeviceResult, DeviceSetup, MachineContext,
    RegisterDef, Vector,
};

pub const SECTOR_SIZE: u32 = 512;

const REG_DATA16: u32 = 0x00;
const REG_DATA8: u32 = 0x01;
const REG_ERROR: u32 = 0x03; // FEATURE on write
const REG_SECTOR_COUNT: u32 = 0x05;
const REG_SECTOR_NUMBER: u32 = 0x07;
const REG_CYLINDER_LOW: u32 = 0x09;
const REG_CYLINDER_HIGH: u32 = 0x0B;
const REG_DRIVE_HEAD: u32 = 0x0D;
const REG_STATUS: u32 = 0x0F; // COMMAND on write

pub const STATUS_ERR: u8 = 0x01;
pub const STATUS_DRQ: u8 = 0x08;
pub const STATUS_DF: u8 = 0x20;
pub const STATUS_DRDY: u8 = 0x40;
pub const STATUS_BSY: u8 = 0x80;

pub const ERROR_ABORT: u8 = 0x04;
pub const ERROR_UNCORRECTABLE: u8 = 0x40;

const DRH_LBA_EN: u8 = 0x40;
const DRH_HEAD_MASK: u8 = 0x0F;

pub const CMD_READ_SECTORS: u8 = 0x20;
pub const CMD_WRITE_SECTORS: u8 = 0x30;
pub const CMD_IDENTIFY_DEVICE: u8 = 0xEC;

/// Sector-addressed backing store.
pub trait Backing: Read + Write + Seek {}

impl<T: Read + Write + Seek> Backing for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    None,
    Read,
    Write,
    Identify,
}

pub struct CompactFlash {
    backing: Option<Box<dyn Backing>>,
    size_bytes: u64,
    identify: [u8; SECTOR_SIZE as usize],

    r_status: u8,
    r_error: u8,
    r_feature: u8,
    r_sector_count: u8,
    r_sector_number: u8,
    r_cylinder: u16,
    r_drive_head: u8,

    mode: TransferMode,
    bytes_remaining: u32,
}

impl CompactFlash {
    pub const REGISTERS: &'static [RegisterDef] = &[
        RegisterDef::read("DATA16", REG_DATA16, AccessWidth::Word),
        RegisterDef::read("DATA8", REG_DATA8, AccessWidth::Byte),
        RegisterDef::read("ERROR", REG_ERROR, AccessWidth::Byte),
        RegisterDef::read("SECTOR_COUNT", REG_SECTOR_COUNT, AccessWidth::Byte),
        RegisterDef::read("SECTOR_NUMBER", REG_SECTOR_NUMBER, AccessWidth::Byte),
        RegisterDef::read("CYLINDER_LOW", REG_CYLINDER_LOW, AccessWidth::Byte),
        RegisterDef::read("CYLINDER_HIGH", REG_CYLINDER_HIGH, AccessWidth::Byte),
        RegisterDef::read("DRIVE/HEAD", REG_DRIVE_HEAD, AccessWidth::Byte),
        RegisterDef::read("STATUS", REG_STATUS, AccessWidth::Byte),
        RegisterDef::write("DATA16", REG_DATA16, AccessWidth::Word),
        RegisterDef::write("DATA8", REG_DATA8, AccessWidth::Byte),
        RegisterDef::write("FEATURE", REG_ERROR, AccessWidth::Byte),
        RegisterDef::write("SECTOR_COUNT", REG_SECTOR_COUNT, AccessWidth::Byte),
        RegisterDef::write("SECTOR_NUMBER", REG_SECTOR_NUMBER, AccessWidth::Byte),
        RegisterDef::write("CYLINDER_LOW", REG_CYLINDER_LOW, AccessWidth::Byte),
        RegisterDef::write("CYLINDER_HIGH", REG_CYLINDER_HIGH, AccessWidth::Byte),
        RegisterDef::write("DRIVE/HEAD", REG_DRIVE_HEAD, AccessWidth::Byte),
        RegisterDef::write("COMMAND", REG_STATUS, AccessWidth::Byte),
    ];

    /// Build from the `diskfile` option. Without a disk file the card
    /// reports device-fault status and all I/O fails.
    pub fn new(setup: &mut DeviceSetup<'_>) -> Result<Self, ConfigError> {
        setup.options().require_address(setup.name())?;
        setup.add_registers(Self::REGISTERS)?;

        match setup.options().get("diskfile") {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|source| ConfigError::Io {
                        path: path.into(),
                        source,
                    })?;
                let size = file
                    .metadata()
                    .map_err(|source| ConfigError::Io { path: path.into(), source })?
                    .len();
                if size % u64::from(SECTOR_SIZE) != 0 {
                    return Err(ConfigError::Device {
                        device: setup.name().to_string(),
                        message: format!(
                            "disk file {path} size {size} is not a multiple of the sector size"
                        ),
                    });
                }
                Ok(Self::from_parts(Some(Box::new(file)), size))
            }
            None => Ok(Self::from_parts(None, 0)),
        }
    }

    /// Build over an arbitrary backing store (tests use an in-memory
    /// cursor). The store length must be sector-aligned.
    pub fn with_backing(
        setup: &mut DeviceSetup<'_>,
        mut backing: Box<dyn Backing>,
    ) -> Result<Self, ConfigError> {
        setup.options().require_address(setup.name())?;
        setup.add_registers(Self::REGISTERS)?;
        let size = backing
            .seek(SeekFrom::End(0))
            .map_err(|e| ConfigError::Device {
                device: setup.name().to_string(),
                message: e.to_string(),
            })?;
        if size % u64::from(SECTOR_SIZE) != 0 {
            return Err(ConfigError::Device {
                device: setup.name().to_string(),
                message: format!("backing size {size} is not a multiple of the sector size"),
            });
        }
        Ok(Self::from_parts(Some(backing), size))
    }

    fn from_parts(backing: Option<Box<dyn Backing>>, size_bytes: u64) -> Self {
        let status = if backing.is_some() { STATUS_DRDY } else { STATUS_DF };
        let sectors = (size_bytes / u64::from(SECTOR_SIZE)) as u32;
        Self {
            backing,
            size_bytes,
            identify: identify_data(sectors),
            r_status: status,
            r_error: 0,
            r_feature: 0,
            r_sector_count: 0,
            r_sector_number: 0,
            r_cylinder: 0,
            r_drive_head: 0,
            mode: TransferMode::None,
            bytes_remaining: 0,
        }
    }

    fn lba(&self) -> DeviceResult<u32> {
        if self.r_drive_head & DRH_LBA_EN == 0 {
            return Err(DeviceFault::new("CHS mode not supported"));
        }
        Ok(u32::from(self.r_sector_number)
            | (u32::from(self.r_cylinder) << 8)
            | (u32::from(self.r_drive_head & DRH_HEAD_MASK) << 24))
    }

    fn command(&mut self, ctx: &mut MachineContext<'_>, command: u8) -> DeviceResult {
        match command {
            CMD_READ_SECTORS => {
                ctx.trace("READ");
                self.start_io(ctx, TransferMode::Read)
            }
            CMD_WRITE_SECTORS => {
                ctx.trace("WRITE");
                self.start_io(ctx, TransferMode::Write)
            }
            CMD_IDENTIFY_DEVICE => {
                ctx.trace("IDENTIFY");
                self.r_status = STATUS_DRDY | STATUS_DRQ;
                self.r_error = 0;
                self.bytes_remaining = SECTOR_SIZE;
                self.mode = TransferMode::Identify;
                Ok(())
            }
            other => {
                ctx.trace(&format!("command {other:#04x} not supported"));
                self.r_status = STATUS_ERR;
                self.r_error = ERROR_ABORT;
                Ok(())
            }
        }
    }

    fn start_io(&mut self, ctx: &mut MachineContext<'_>, mode: TransferMode) -> DeviceResult {
        // in the FAULT state (no backing file) all I/O fails
        if self.r_status & STATUS_DF != 0 {
            ctx.trace("no device");
            self.r_status |= STATUS_ERR;
            self.r_error = ERROR_UNCORRECTABLE;
            return Ok(());
        }
        self.r_status &= !(STATUS_ERR | STATUS_DRQ);
        self.r_error = 0;

        let sectors = if self.r_sector_count == 0 { 256 } else { u32::from(self.r_sector_count) };
        let offset = u64::from(self.lba()?) * u64::from(SECTOR_SIZE);
        self.bytes_remaining = sectors * SECTOR_SIZE;

        if offset + u64::from(self.bytes_remaining) > self.size_bytes {
            ctx.trace("access beyond end of device");
            self.r_status |= STATUS_ERR;
            self.r_error = ERROR_UNCORRECTABLE;
            return Ok(());
        }

        let backing = self.backing.as_mut().ok_or_else(|| DeviceFault::new("no backing store"))?;
        backing.seek(SeekFrom::Start(offset))?;
        self.r_status |= STATUS_DRQ;
        self.mode = mode;
        Ok(())
    }

    fn data_read(&mut self, ctx: &mut MachineContext<'_>, width: AccessWidth) -> DeviceResult<u32> {
        let count = if width == AccessWidth::Byte { 1u32 } else { 2 };
        match self.mode {
            TransferMode::Read | TransferMode::Identify => {}
            _ => {
                ctx.trace("data read when not reading / identifying");
                return Ok(0);
            }
        }
        if self.bytes_remaining < count {
            ctx.trace("read beyond sector buffer");
            return Ok(0);
        }

        let value = match self.mode {
            TransferMode::Read => {
                let backing =
                    self.backing.as_mut().ok_or_else(|| DeviceFault::new("no backing store"))?;
                let mut buf = [0u8; 2];
                backing.read_exact(&mut buf[..count as usize])?;
                if count == 1 {
                    u32::from(buf[0])
                } else {
                    // 16-bit data port: low byte first
                    (u32::from(buf[1]) << 8) | u32::from(buf[0])
                }
            }
            TransferMode::Identify => {
                let index = (SECTOR_SIZE - self.bytes_remaining) as usize;
                if count == 1 {
                    u32::from(self.identify[index])
                } else {
                    (u32::from(self.identify[index + 1]) << 8) | u32::from(self.identify[index])
                }
            }
            _ => unreachable!(),
        };

        self.bytes_remaining -= count;
        if self.bytes_remaining == 0 {
            self.r_status &= !STATUS_DRQ;
            self.mode = TransferMode::None;
        }
        Ok(value)
    }

    fn data_write(&mut self, ctx: &mut MachineContext<'_>, width: AccessWidth, value: u32) -> DeviceResult {
        if self.mode != TransferMode::Write {
            ctx.trace("data write when not writing");
            return Ok(());
        }
        let mut buf = [0u8; 2];
        buf[0] = value as u8;
        let count: u32 = if width == AccessWidth::Byte {
            1
        } else {
            buf[1] = (value >> 8) as u8;
            2
        };
        if self.bytes_remaining < count {
            ctx.trace("write beyond sector buffer");
            return Ok(());
        }
        let backing = self.backing.as_mut().ok_or_else(|| DeviceFault::new("no backing store"))?;
        backing.write_all(&buf[..count as usize])?;
        self.bytes_remaining -= count;
        if self.bytes_remaining == 0 {
            self.r_status &= !STATUS_DRQ;
            self.mode = TransferMode::None;
            backing.flush()?;
        }
        Ok(())
    }
}

impl Device for CompactFlash {
    fn reset(&mut self, _ctx: &mut MachineContext<'_>) -> DeviceResult {
        self.r_status = if self.backing.is_some() { STATUS_DRDY } else { STATUS_DF };
        self.r_error = 0;
        self.r_feature = 0;
        self.r_sector_count = 0;
        self.r_sector_number = 0;
        self.r_cylinder = 0;
        self.r_drive_head = 0;
        self.mode = TransferMode::None;
        self.bytes_remaining = 0;
        Ok(())
    }

    fn read(&mut self, ctx: &mut MachineContext<'_>, width: AccessWidth, offset: u32) -> DeviceResult<u32> {
        let value = match offset {
            REG_DATA16 | REG_DATA8 => return self.data_read(ctx, width),
            REG_ERROR => u32::from(self.r_error),
            REG_SECTOR_COUNT => u32::from(self.r_sector_count),
            REG_SECTOR_NUMBER => u32::from(self.r_sector_number),
            REG_CYLINDER_LOW => u32::from(self.r_cylinder & 0xFF),
            REG_CYLINDER_HIGH => u32::from(self.r_cylinder >> 8),
            REG_DRIVE_HEAD => u32::from(self.r_drive_head),
            REG_STATUS => u32::from(self.r_status),
            other => return Err(DeviceFault::new(format!("read from {other:#04x} not handled"))),
        };
        Ok(value)
    }

    fn write(&mut self, ctx: &mut MachineContext<'_>, width: AccessWidth, offset: u32, value: u32) -> DeviceResult {
        match offset {
            REG_DATA16 | REG_DATA8 => return self.data_write(ctx, width, value),
            REG_ERROR => self.r_feature = value as u8,
            REG_SECTOR_COUNT => self.r_sector_count = value as u8,
            REG_SECTOR_NUMBER => self.r_sector_number = value as u8,
            REG_CYLINDER_LOW => self.r_cylinder = (self.r_cylinder & 0xFF00) | value as u16 & 0xFF,
            REG_CYLINDER_HIGH => {
                self.r_cylinder = (self.r_cylinder & 0x00FF) | ((value as u16 & 0xFF) << 8);
            }
            REG_DRIVE_HEAD => self.r_drive_head = value as u8,
            REG_STATUS => return self.command(ctx, value as u8),
            other => return Err(DeviceFault::new(format!("write to {other:#04x} not handled"))),
        }
        Ok(())
    }

    fn get_vector(&mut self, _ctx: &mut MachineContext<'_>, _level: u8) -> Vector {
        Vector::Spurious
    }
}

/// Build the 512-byte IDENTIFY DEVICE sector for a card of `sectors`
/// addressable sectors. Words are stored big-endian in the buffer and
/// byte-swapped by the 16-bit data port, as on the real part strapped to
/// a big-endian bus.
fn identify_data(sectors: u32) -> [u8; SECTOR_SIZE as usize] {
    let mut data = [0u8; SECTOR_SIZE as usize];
    let mut word = |index: usize, value: u16| {
        data[index * 2..index * 2 + 2].copy_from_slice(&value.to_be_bytes());
    };
    word(1, 16383); // cylinders
    word(3, 16); // heads
    word(6, 63); // sectors per track
    word(47, 1); // max sectors per READ/WRITE MULTIPLE
    word(60, (sectors & 0xFFFF) as u16); // addressable sectors, low
    word(61, (sectors >> 16) as u16); // addressable sectors, high
    let mut text = |index: usize, len_words: usize, value: &str| {
        let bytes = value.as_bytes();
        for i in 0..len_words * 2 {
            data[index * 2 + i] = bytes.get(i).copied().unwrap_or(b' ');
        }
    };
    text(10, 10, "00000000"); // serial number
    text(23, 4, "00000000"); // firmware version
    text(27, 20, "emulated CF"); // model number
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_sector_counts_land_in_words_60_61() {
        let data = identify_data(2048);
        assert_eq!(&data[120..124], &[0x08, 0x00, 0x00, 0x00]);
        // trailing reserved words are zero
        assert!(data[258..].iter().all(|&b| b == 0));
    }

    #[test]
    fn identify_geometry_words() {
        let data = identify_data(2048);
        assert_eq!(u16::from_be_bytes([data[2], data[3]]), 16383);
        assert_eq!(u16::from_be_bytes([data[6], data[7]]), 16);
        assert_eq!(u16::from_be_bytes([data[12], data[13]]), 63);
    }
}
