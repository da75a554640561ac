//! FPGA bitstream management for the Kingst LA family.
//!
//! Unlike the SIGMA there is only one bitstream per model, and a correctly
//! configured FPGA survives re-opening the device, so bring-up first probes
//! whether the configuration can be reused and only then pays for the
//! upload.

use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use crate::firmware::{self, FirmwareLoader};
use crate::la2016_proto as proto;
use crate::transport::{write_all, ControlTransport};
use crate::{Error, Result};

const BITSTREAM_CHUNK: usize = 4096;
const BITSTREAM_PAD: usize = 2048;

/// Check whether the FPGA still carries a healthy configuration: the init
/// byte reads zero, the run state carries its signature without an
/// acquisition in flight, and no PWM channel was left enabled.
pub fn bitstream_reusable<T: ControlTransport + ?Sized>(transport: &mut T) -> Result<bool> {
    let mut init = [0u8; 1];
    transport.ctrl_in(proto::CMD_FPGA_INIT, 0, 0, &mut init)?;
    if init[0] != 0 {
        return Ok(false);
    }
    let status = proto::run_status(transport)?;
    if !status.signature_ok() {
        return Ok(false);
    }
    let pwm_en = proto::read_reg_u8(transport, proto::REG_PWM_EN)?;
    Ok(pwm_en & 0x03 == 0)
}

/// Push the named bitstream resource into the FPGA and enable it.
pub fn upload_bitstream<T: ControlTransport + ?Sized>(
    transport: &mut T,
    loader: &dyn FirmwareLoader,
    name: &str,
) -> Result<()> {
    let image = firmware::load_bounded(loader, name)?;
    info!("uploading FPGA bitstream {} ({} bytes)", name, image.len());

    let mut size = [0u8; 4];
    LittleEndian::write_u32(&mut size, image.len() as u32);
    transport.ctrl_out(proto::CMD_FPGA_INIT, 0, 0, &size)?;

    // Stream in fixed chunks, zero-padding the tail to the next 2 KiB
    // boundary the FPGA expects.
    let padded = (image.len() + BITSTREAM_PAD - 1) / BITSTREAM_PAD * BITSTREAM_PAD;
    let mut sent = 0;
    let mut chunk = [0u8; BITSTREAM_CHUNK];
    while sent < padded {
        let n = BITSTREAM_CHUNK.min(padded - sent);
        for (i, slot) in chunk[..n].iter_mut().enumerate() {
            *slot = *image.get(sent + i).unwrap_or(&0);
        }
        write_all(transport, &chunk[..n])?;
        sent += n;
    }

    let mut response = [0u8; 1];
    transport.ctrl_in(proto::CMD_FPGA_INIT, 0, 0, &mut response)?;
    if response[0] != 0 {
        return Err(Error::Protocol(format!(
            "FPGA init reported {:#04x} after bitstream upload",
            response[0]
        )));
    }
    thread::sleep(Duration::from_millis(30));
    transport.ctrl_out(proto::CMD_FPGA_ENABLE, 1, 0, &[])?;
    thread::sleep(Duration::from_millis(40));
    Ok(())
}

/// Full bring-up: reuse or upload, then check the run-state signature.
pub fn bringup<T: ControlTransport + ?Sized>(
    transport: &mut T,
    loader: &dyn FirmwareLoader,
    bitstream: &str,
) -> Result<()> {
    if bitstream_reusable(transport)? {
        debug!("reusing already configured bitstream");
    } else {
        upload_bitstream(transport, loader, bitstream)?;
    }
    let status = proto::run_status(transport)?;
    if !status.signature_ok() {
        return Err(Error::Protocol(format!(
            "run state {:#06x} after FPGA bring-up",
            status.bits()
        )));
    }
    Ok(())
}
