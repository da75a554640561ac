//! The FPGA register protocol of the SIGMA family.
//!
//! In FIFO mode every byte sent to the FPGA carries a 4-bit opcode in its
//! high nibble and a 4-bit operand in its low nibble. Writing a register
//! means addressing it and streaming data nibbles; reading means addressing
//! and issuing one read command per byte wanted. Multi-byte registers are
//! little-endian and occupy consecutive addresses.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::transport::{read_full, write_all, BitbangBridge};
use crate::{Error, Result};

/// Command opcodes (high nibble of each FIFO byte).
pub const CMD_ADDR_LOW: u8 = 0x00;
pub const CMD_ADDR_HIGH: u8 = 0x10;
pub const CMD_DATA_LOW: u8 = 0x20;
pub const CMD_DATA_HIGH_WRITE: u8 = 0x30;
pub const CMD_READ_ADDR: u8 = 0x40;
pub const CMD_DRAM_WAIT_ACK: u8 = 0x50;
pub const CMD_DRAM_BLOCK: u8 = 0x60;
pub const CMD_DRAM_BLOCK_BEGIN: u8 = 0x80;
pub const CMD_DRAM_BLOCK_DATA: u8 = 0xa0;

/// OR'ed onto [`CMD_READ_ADDR`] to post-increment the address.
pub const READ_ADDR_INC: u8 = 0x10;

/// OR'ed onto the DRAM block commands to select the second BRAM bank.
pub const DRAM_SEL_BANK: u8 = 0x02;

/// Write-side register map.
pub const WREG_CLOCK_SELECT: u8 = 0;
pub const WREG_TRIGGER_SELECT: u8 = 1;
pub const WREG_TRIGGER_SELECT2: u8 = 2;
pub const WREG_MODE: u8 = 3;
pub const WREG_MEMROW: u8 = 4;
pub const WREG_POST_TRIGGER: u8 = 5;
pub const WREG_TRIGGER_OPTION: u8 = 6;
pub const WREG_PIN_VIEW: u8 = 7;
pub const WREG_TEST: u8 = 15;

/// Read-side register map.
pub const RREG_ID: u8 = 0;
pub const RREG_TRIGGER_POS_LOW: u8 = 1;
pub const RREG_TRIGGER_POS_HIGH: u8 = 2;
pub const RREG_TRIGGER_POS_UP: u8 = 3;
pub const RREG_STOP_POS_LOW: u8 = 4;
pub const RREG_STOP_POS_HIGH: u8 = 5;
pub const RREG_STOP_POS_UP: u8 = 6;
pub const RREG_MODE: u8 = 7;
pub const RREG_PIN_CHANGE_LOW: u8 = 8;
pub const RREG_PIN_CHANGE_HIGH: u8 = 9;
pub const RREG_BLOCK_LAST_TS_LOW: u8 = 10;
pub const RREG_BLOCK_LAST_TS_HIGH: u8 = 11;
pub const RREG_BLOCK_TS_OVERRUN: u8 = 12;
pub const RREG_PIN_VIEW: u8 = 13;

/// Value the ID register reads back as.
pub const SIGMA_ID: u8 = 0xa6;

bitflags! {
    /// Mode register, write side.
    pub struct WriteMode: u8 {
        const SDRAM_WRITE_EN = 0x01;
        const SDRAM_READ_EN = 0x02;
        const TRIGGER_RESET = 0x04;
        const TRIGGER_EN = 0x08;
        const FORCE_STOP = 0x10;
        const TRIGGER_SOFTWARE = 0x20;
        const SDRAM_INIT = 0x80;
    }
}

bitflags! {
    /// Mode register, read side.
    pub struct ReadMode: u8 {
        const SDRAM_WRITE_EN = 0x01;
        const SDRAM_READ_EN = 0x02;
        const TRIGGER_EN = 0x08;
        const ROUND = 0x10;
        const TRIGGERED = 0x20;
        const POST_TRIGGERED = 0x40;
    }
}

/// Trigger-select-2 register bits. The register doubles as the LUT upload
/// strobe and, in the 100/200 MHz firmware, as the fast trigger pin select.
pub const TRGSEL2_PIN_MASK: u8 = 0x07;
pub const TRGSEL2_PINPOL_RISE: u8 = 0x08;
pub const TRGSEL2_LUT_ADDR_MASK: u8 = 0x0f;
pub const TRGSEL2_LUT_WRITE: u8 = 0x10;
pub const TRGSEL2_RESET: u8 = 0x20;
pub const TRGSEL2_LEDSEL0: u8 = 0x40;
pub const TRGSEL2_LEDSEL1: u8 = 0x80;

/// Trigger-option register bits.
pub const TRGOPT_TRGIEN: u8 = 0x80;
pub const TRGOPT_TRGOEN: u8 = 0x40;

/// Sample memory geometry.
pub const ROW_COUNT: usize = 32768;
pub const ROW_LENGTH_BYTES: usize = 1024;
pub const CLUSTERS_PER_ROW: usize = 64;
pub const EVENTS_PER_CLUSTER: usize = 7;
pub const EVENTS_PER_ROW: usize = CLUSTERS_PER_ROW * EVENTS_PER_CLUSTER;

/// An acquisition position packs the row in its upper 15 bits and the event
/// offset within the row in its lower 9.
pub const ROW_SHIFT: u32 = 9;
pub const EVENT_MASK: u32 = 0x1ff;

/// Largest register span written in one command burst.
const MAX_REG_SPAN: usize = 16;

/// Rows fetched per DRAM burst.
pub const MAX_DRAM_BATCH: usize = 32;

/// Consecutive empty reads tolerated on the register path.
const REG_READ_RETRIES: usize = 3;

/// Split a 24-bit acquisition position into (row, event) indices. The event
/// part addresses one of 512 slots but only `EVENTS_PER_ROW` carry samples;
/// callers clamp where appropriate.
pub fn split_position(position: u32) -> (usize, usize) {
    (
        ((position >> ROW_SHIFT) as usize) % ROW_COUNT,
        (position & EVENT_MASK) as usize,
    )
}

/// Write `data` into register `reg`. Multi-byte spans stream into the
/// register in order, low byte first.
pub fn write_register<B: BitbangBridge + ?Sized>(
    bridge: &mut B,
    reg: u8,
    data: &[u8],
) -> Result<()> {
    if data.len() > MAX_REG_SPAN {
        return Err(Error::Bug("register write span too large"));
    }
    let mut buf = [0u8; 2 + 2 * MAX_REG_SPAN];
    let mut idx = 0;
    buf[idx] = CMD_ADDR_LOW | (reg & 0xf);
    idx += 1;
    buf[idx] = CMD_ADDR_HIGH | (reg >> 4);
    idx += 1;
    for &byte in data {
        buf[idx] = CMD_DATA_LOW | (byte & 0xf);
        idx += 1;
        buf[idx] = CMD_DATA_HIGH_WRITE | (byte >> 4);
        idx += 1;
    }
    trace!("reg {:#04x} <- {:02x?}", reg, data);
    write_all(bridge, &buf[..idx])
}

/// Write a single-byte register.
pub fn set_register<B: BitbangBridge + ?Sized>(bridge: &mut B, reg: u8, value: u8) -> Result<()> {
    write_register(bridge, reg, &[value])
}

/// Read `buf.len()` bytes starting at register `reg`, auto-incrementing
/// through consecutive addresses for multi-byte spans.
pub fn read_register<B: BitbangBridge + ?Sized>(
    bridge: &mut B,
    reg: u8,
    buf: &mut [u8],
) -> Result<()> {
    if buf.len() > MAX_REG_SPAN {
        return Err(Error::Bug("register read span too large"));
    }
    let mut cmd = [0u8; 2 + MAX_REG_SPAN];
    let mut idx = 0;
    cmd[idx] = CMD_ADDR_LOW | (reg & 0xf);
    idx += 1;
    cmd[idx] = CMD_ADDR_HIGH | (reg >> 4);
    idx += 1;
    let read_cmd = if buf.len() > 1 {
        CMD_READ_ADDR | READ_ADDR_INC
    } else {
        CMD_READ_ADDR
    };
    for _ in 0..buf.len() {
        cmd[idx] = read_cmd;
        idx += 1;
    }
    write_all(bridge, &cmd[..idx])?;
    read_full(bridge, buf, REG_READ_RETRIES)?;
    trace!("reg {:#04x} -> {:02x?}", reg, buf);
    Ok(())
}

/// Read a single-byte register.
pub fn get_register<B: BitbangBridge + ?Sized>(bridge: &mut B, reg: u8) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_register(bridge, reg, &mut buf)?;
    Ok(buf[0])
}

/// Trigger and stop positions, as latched by the FPGA when sampling ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Positions {
    pub trigger: u32,
    pub stop: u32,
}

/// Read the 24-bit trigger and stop positions in one register burst.
pub fn read_positions<B: BitbangBridge + ?Sized>(bridge: &mut B) -> Result<Positions> {
    let mut buf = [0u8; 6];
    read_register(bridge, RREG_TRIGGER_POS_LOW, &mut buf)?;
    Ok(Positions {
        trigger: LittleEndian::read_u24(&buf[0..3]),
        stop: LittleEndian::read_u24(&buf[3..6]),
    })
}

/// Read the mode register's status side.
pub fn read_mode<B: BitbangBridge + ?Sized>(bridge: &mut B) -> Result<ReadMode> {
    Ok(ReadMode::from_bits_truncate(get_register(
        bridge, RREG_MODE,
    )?))
}

/// Fetch `row_count` rows of sample memory starting at `start_row`.
///
/// The burst interleaves block fetches with data reads against alternating
/// BRAM banks, so the FPGA prefetches the next row from DRAM while the
/// previous one drains over USB; each fetch is followed by an ack wait.
pub fn read_dram<B: BitbangBridge + ?Sized>(
    bridge: &mut B,
    start_row: u16,
    row_count: usize,
    out: &mut [u8],
) -> Result<()> {
    if row_count == 0 {
        return Ok(());
    }
    if row_count > MAX_DRAM_BATCH || out.len() < row_count * ROW_LENGTH_BYTES {
        return Err(Error::Bug("DRAM burst does not fit its buffer"));
    }
    let mut row = [0u8; 2];
    LittleEndian::write_u16(&mut row, start_row);
    write_register(bridge, WREG_MEMROW, &row)?;

    let mut cmd = [0u8; 2 + 3 * MAX_DRAM_BATCH];
    let mut idx = 0;
    cmd[idx] = CMD_DRAM_BLOCK;
    idx += 1;
    cmd[idx] = CMD_DRAM_WAIT_ACK;
    idx += 1;
    for chunk in 0..row_count {
        let sel = chunk % 2 == 1;
        let is_last = chunk == row_count - 1;
        if !is_last {
            cmd[idx] = CMD_DRAM_BLOCK | bank_bit(!sel);
            idx += 1;
        }
        cmd[idx] = CMD_DRAM_BLOCK_DATA | bank_bit(sel);
        idx += 1;
        if !is_last {
            cmd[idx] = CMD_DRAM_WAIT_ACK;
            idx += 1;
        }
    }
    write_all(bridge, &cmd[..idx])?;
    read_full(bridge, &mut out[..row_count * ROW_LENGTH_BYTES], REG_READ_RETRIES)
}

fn bank_bit(second: bool) -> u8 {
    if second {
        DRAM_SEL_BANK
    } else {
        0
    }
}
