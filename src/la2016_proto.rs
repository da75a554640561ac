//! The Cypress FX2 vendor protocol of the Kingst LA family.
//!
//! The MCU exposes the FPGA's register file through a single vendor request
//! whose `wValue` is the register address; direction comes from the control
//! transfer itself (the R/W bit in the address is managed by the bridge).
//! Bulk capture data arrives on a dedicated endpoint after a start request.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use zerocopy::{FromBytes, Unaligned};

use crate::transport::ControlTransport;
use crate::wire::{U32Le, WireRead};
use crate::{Error, Result};

/// Vendor control requests.
pub const CMD_FPGA_ENABLE: u8 = 0x10;
pub const CMD_FPGA_SPI: u8 = 0x20;
pub const CMD_BULK_START: u8 = 0x30;
pub const CMD_BULK_RESET: u8 = 0x38;
pub const CMD_FPGA_INIT: u8 = 0x50;
pub const CMD_KAUTH: u8 = 0x60;
pub const CMD_EEPROM: u8 = 0xa2;

/// FPGA register addresses (`wValue` of `CMD_FPGA_SPI`).
pub const REG_RUN: u16 = 0x00;
pub const REG_PWM_EN: u16 = 0x02;
pub const REG_CAPT_MODE: u16 = 0x03;
pub const REG_BULK: u16 = 0x08;
pub const REG_SAMPLING: u16 = 0x10;
pub const REG_TRIGGER: u16 = 0x20;
pub const REG_THRESHOLD: u16 = 0x68;
pub const REG_PWM1: u16 = 0x70;
pub const REG_PWM2: u16 = 0x78;

/// Trigger register writes carry this `wIndex`; anything else is rejected
/// by the vendor firmware.
pub const TRIGGER_REG_INDEX: u16 = 16;

/// Run-mode commands written to `REG_RUN`.
pub const RUNMODE_HALT: u8 = 0x00;
pub const RUNMODE_RUN: u8 = 0x03;

/// Capture modes written to `REG_CAPT_MODE`.
pub const CAPTMODE_MEMORY: u8 = 0x00;
pub const CAPTMODE_STREAM: u8 = 0x01;

bitflags! {
    /// The run-state word read from `REG_RUN`: a constant signature in the
    /// upper bits, capture status in the low nibble.
    pub struct RunStatus: u16 {
        /// Post-trigger memory has been filled; the capture stopped on its
        /// own.
        const DONE = 0x0001;
        const TRIGGERED = 0x0002;
        /// The value a healthy FPGA keeps under `SIGNATURE_MASK`.
        const SIGNATURE = 0x85e0;
        const SIGNATURE_MASK = 0xfff0;
    }
}

impl RunStatus {
    pub fn signature_ok(self) -> bool {
        self & RunStatus::SIGNATURE_MASK == RunStatus::SIGNATURE
    }
}

/// Transfer-packet geometry of the bulk capture stream: five run-length
/// pairs of `(u16 state, u8 repetitions)` plus a sequence byte.
pub const RLE_PAIRS_PER_PACKET: usize = 5;
pub const RLE_PAIR_BYTES: usize = 3;
pub const TRANSFER_PACKET_BYTES: usize = 16;

/// Capture bookkeeping read back from `REG_BULK` after a run stops.
#[derive(FromBytes, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct CaptureInfo {
    pub n_rep_packets: U32Le,
    pub n_rep_packets_before_trigger: U32Le,
    pub write_pos: U32Le,
}

pub fn read_reg<T: ControlTransport + ?Sized>(
    transport: &mut T,
    reg: u16,
    buf: &mut [u8],
) -> Result<()> {
    transport.ctrl_in(CMD_FPGA_SPI, reg, 0, buf)?;
    trace!("reg {:#04x} -> {:02x?}", reg, buf);
    Ok(())
}

pub fn write_reg<T: ControlTransport + ?Sized>(
    transport: &mut T,
    reg: u16,
    data: &[u8],
) -> Result<()> {
    trace!("reg {:#04x} <- {:02x?}", reg, data);
    transport.ctrl_out(CMD_FPGA_SPI, reg, 0, data)
}

pub fn read_reg_u8<T: ControlTransport + ?Sized>(transport: &mut T, reg: u16) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_reg(transport, reg, &mut buf)?;
    Ok(buf[0])
}

pub fn write_reg_u8<T: ControlTransport + ?Sized>(
    transport: &mut T,
    reg: u16,
    value: u8,
) -> Result<()> {
    write_reg(transport, reg, &[value])
}

pub fn run_status<T: ControlTransport + ?Sized>(transport: &mut T) -> Result<RunStatus> {
    let mut buf = [0u8; 2];
    read_reg(transport, REG_RUN, &mut buf)?;
    Ok(RunStatus::from_bits_truncate(LittleEndian::read_u16(&buf)))
}

pub fn read_capture_info<T: ControlTransport + ?Sized>(transport: &mut T) -> Result<CaptureInfo> {
    let mut buf = [0u8; 12];
    read_reg(transport, REG_BULK, &mut buf)?;
    buf.as_ref()
        .read_at::<CaptureInfo>(0)
        .copied()
        .ok_or(Error::Bug("capture info buffer too short"))
}
