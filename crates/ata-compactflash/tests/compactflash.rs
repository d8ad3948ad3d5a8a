//! CompactFlash behavior driven through the machine with a scripted CPU
//! and an in-memory disk image.

use std::io::Cursor;

use ata_compactflash::{
    CompactFlash, CMD_IDENTIFY_DEVICE, CMD_READ_SECTORS, CMD_WRITE_SECTORS, SECTOR_SIZE,
    STATUS_DRQ, STATUS_ERR,
};
use sim_core::scripted::{ScriptOp, ScriptedCpu};
use sim_core::{AccessWidth, DeviceOptions, Machine, MachineConfig};

const BASE: u32 = 0xFFE000;

const DATA16: u32 = BASE + 0x00;
const DATA8: u32 = BASE + 0x01;
const SECTOR_COUNT: u32 = BASE + 0x05;
const SECTOR_NUMBER: u32 = BASE + 0x07;
const CYL_LOW: u32 = BASE + 0x09;
const CYL_HIGH: u32 = BASE + 0x0B;
const DRIVE_HEAD: u32 = BASE + 0x0D;
const STATUS: u32 = BASE + 0x0F;
const COMMAND: u32 = BASE + 0x0F;

const LBA_ENABLE: u32 = 0x40;

fn read8(addr: u32) -> ScriptOp {
    ScriptOp::Read { addr, width: AccessWidth::Byte }
}

fn write8(addr: u32, value: u32) -> ScriptOp {
    ScriptOp::Write { addr, width: AccessWidth::Byte, value }
}

fn read16(addr: u32) -> ScriptOp {
    ScriptOp::Read { addr, width: AccessWidth::Word }
}

fn cf_machine(script: Vec<ScriptOp>, image: Vec<u8>) -> Machine<ScriptedCpu> {
    let mut cpu = ScriptedCpu::new();
    cpu.push_all(script);
    let config = MachineConfig { cycle_limit: Some(1_000_000), ..MachineConfig::default() };
    let mut machine = Machine::new(config, cpu);
    machine.add_memory(0, 0x1000, true).expect("ram");
    let options = DeviceOptions::new().address(BASE);
    machine
        .add_device("CF", &options, |setup| {
            CompactFlash::with_backing(setup, Box::new(Cursor::new(image)))
        })
        .expect("cf");
    machine
}

fn select_lba(lba: u32, count: u32) -> Vec<ScriptOp> {
    vec![
        write8(DRIVE_HEAD, LBA_ENABLE | (lba >> 24 & 0x0F)),
        write8(CYL_HIGH, lba >> 16 & 0xFF),
        write8(CYL_LOW, lba >> 8 & 0xFF),
        write8(SECTOR_NUMBER, lba & 0xFF),
        write8(SECTOR_COUNT, count),
    ]
}

#[test]
fn identify_reports_total_sectors_in_words_60_61() {
    // 1 MiB card = 2048 sectors
    let mut script = vec![write8(COMMAND, u32::from(CMD_IDENTIFY_DEVICE)), read8(STATUS)];
    script.extend((0..SECTOR_SIZE).map(|_| read8(DATA8)));
    script.push(read8(STATUS));

    let mut machine = cf_machine(script, vec![0u8; 1024 * 1024]);
    machine.run();

    let values = &machine.cpu().read_values;
    let status = values[0];
    assert_eq!(status & u32::from(STATUS_DRQ), u32::from(STATUS_DRQ), "DRQ after IDENTIFY");

    let sector: Vec<u32> = values[1..513].to_vec();
    assert_eq!(sector.len(), 512);
    // words 60-61 carry the sector count, low word first
    assert_eq!(sector[120], 0x08, "0x0800 sectors, stored high byte first");
    assert_eq!(sector[121], 0x00);
    assert_eq!(sector[122], 0x00);
    assert_eq!(sector[123], 0x00);
    // reserved tail is zero
    assert!(sector[258..].iter().all(|&b| b == 0), "trailing bytes are zero");

    let status_after = *values.last().expect("status");
    assert_eq!(status_after & u32::from(STATUS_DRQ), 0, "DRQ drops when drained");
}

#[test]
fn write_then_read_round_trips_through_the_image() {
    let mut script = select_lba(3, 1);
    script.push(write8(COMMAND, u32::from(CMD_WRITE_SECTORS)));
    // one sector of a recognizable pattern, 16 bits at a time
    script.extend((0..SECTOR_SIZE / 2).map(|i| ScriptOp::Write {
        addr: DATA16,
        width: AccessWidth::Word,
        value: (i * 3) & 0xFFFF,
    }));
    script.extend(select_lba(3, 1));
    script.push(write8(COMMAND, u32::from(CMD_READ_SECTORS)));
    script.extend((0..SECTOR_SIZE / 2).map(|_| read16(DATA16)));

    let mut machine = cf_machine(script, vec![0u8; 64 * 1024]);
    machine.run();

    let values = &machine.cpu().read_values;
    let got: Vec<u32> = values[values.len() - 256..].to_vec();
    let want: Vec<u32> = (0..256).map(|i| (i * 3) & 0xFFFF).collect();
    assert_eq!(got, want);
}

#[test]
fn access_beyond_the_end_sets_error() {
    // 16 sectors only
    let mut script = select_lba(15, 2);
    script.push(write8(COMMAND, u32::from(CMD_READ_SECTORS)));
    script.push(read8(STATUS));
    let mut machine = cf_machine(script, vec![0u8; 16 * SECTOR_SIZE as usize]);
    machine.run();
    let status = *machine.cpu().read_values.last().expect("status");
    assert_eq!(status & u32::from(STATUS_ERR), u32::from(STATUS_ERR));
}

#[test]
fn unsupported_command_aborts() {
    let script = vec![write8(COMMAND, 0x99), read8(STATUS), read8(BASE + 0x03)];
    let mut machine = cf_machine(script, vec![0u8; 16 * SECTOR_SIZE as usize]);
    machine.run();
    let values = &machine.cpu().read_values;
    assert_eq!(values[0] & u32::from(STATUS_ERR), u32::from(STATUS_ERR));
    assert_eq!(values[1], 0x04, "abort error code");
}

#[test]
fn misaligned_backing_size_is_rejected() {
    let mut cpu = ScriptedCpu::new();
    cpu.push(ScriptOp::Idle { cycles: 1 });
    let mut machine = Machine::new(
        MachineConfig { cycle_limit: Some(100), ..MachineConfig::default() },
        cpu,
    );
    let options = DeviceOptions::new().address(BASE);
    let err = machine
        .add_device("CF", &options, |setup| {
            CompactFlash::with_backing(setup, Box::new(Cursor::new(vec![0u8; 1000])))
        })
        .expect_err("1000 bytes is not sector aligned");
    assert!(err.to_string().contains("multiple of the sector size"), "{err}");
}
