//! Power-on bring-up of the SIGMA FPGA.
//!
//! The FPGA has no flash of its own; every firmware variant is pushed over
//! the FTDI bridge in bitbang mode, bit by bit, after the currently running
//! netlist has been shut down and the configuration logic reset. Once the
//! netlist is up, a short register handshake switches it into
//! logic-analyzer mode and proves the register file responds.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::firmware::{self, FirmwareLoader};
use crate::sigma_proto as proto;
use crate::transport::{read_full, write_all, BitbangBridge};
use crate::{Error, Result};

/// Bitbang pin assignment of the FTDI-to-FPGA wiring.
pub const PIN_CCLK: u8 = 1 << 0;
pub const PIN_PROG: u8 = 1 << 1;
pub const PIN_D2: u8 = 1 << 2;
pub const PIN_D3: u8 = 1 << 3;
pub const PIN_INIT_B: u8 = 1 << 5;
pub const PIN_DIN: u8 = 1 << 6;
pub const PIN_D7: u8 = 1 << 7;

/// All pins host-driven except the INIT_B readback.
pub const PIN_DIR_MASK: u8 = !PIN_INIT_B;

const UPLOAD_BITRATE: u32 = 750_000;

/// Shuts down whatever netlist currently runs, so the pins shared with the
/// configuration interface become safe to drive.
const SUICIDE: [u8; 8] = [0x84, 0x84, 0x88, 0x84, 0x88, 0x84, 0x88, 0x84];

/// CCLK idle with a PROG pulse to restart FPGA configuration.
const INIT_PULSE: [u8; 10] = [0x01, 0x03, 0x03, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01];

const INIT_RETRIES: usize = 10;
const INIT_POLLS: usize = 10;
const INIT_POLL_DELAY: Duration = Duration::from_millis(10);

/// Response bytes expected from the logic-analyzer mode handshake.
const HANDSHAKE_RESPONSE: [u8; 3] = [proto::SIGMA_ID, 0x55, 0xaa];

fn bitbang_init_once<B: BitbangBridge + ?Sized>(bridge: &mut B) -> Result<()> {
    for _ in 0..4 {
        write_all(bridge, &SUICIDE)?;
    }
    thread::sleep(Duration::from_millis(10));

    write_all(bridge, &INIT_PULSE)?;
    bridge.drain()?;

    // INIT_B stays low while the FPGA clears its configuration memory.
    for _ in 0..INIT_POLLS {
        let mut pins = [0u8; 1];
        if bridge.read(&mut pins)? == 1 && pins[0] & PIN_INIT_B != 0 {
            return Ok(());
        }
        thread::sleep(INIT_POLL_DELAY);
    }
    Err(Error::Timeout("INIT_B did not go high"))
}

fn bitbang_init<B: BitbangBridge + ?Sized>(bridge: &mut B) -> Result<()> {
    for attempt in 1..=INIT_RETRIES {
        match bitbang_init_once(bridge) {
            Ok(()) => return Ok(()),
            Err(Error::Timeout(_)) if attempt < INIT_RETRIES => {
                debug!("FPGA configuration reset attempt {} timed out", attempt);
            }
            Err(err) => return Err(err),
        }
    }
    Err(Error::Timeout("FPGA configuration reset"))
}

/// Expand a netlist image into the bitbang byte stream: two bytes per bit,
/// MSB first, data on DIN with CCLK strobed high then low.
pub(crate) fn bitbang_expand(image: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(image.len() * 16);
    for &byte in image {
        for bit in (0..8).rev() {
            let data = if byte & (1 << bit) != 0 { PIN_DIN } else { 0 };
            out.push(data | PIN_CCLK);
            out.push(data);
        }
    }
    out
}

/// Upload the named netlist resource and leave the device in
/// logic-analyzer mode.
pub fn upload_firmware<B: BitbangBridge + ?Sized>(
    bridge: &mut B,
    loader: &dyn FirmwareLoader,
    name: &str,
) -> Result<()> {
    let mut image = firmware::load_bounded(loader, name)?;
    firmware::descramble_sigma_netlist(&mut image);
    let stream = bitbang_expand(&image);
    info!("uploading FPGA netlist {} ({} bytes)", name, image.len());

    bridge.set_bitbang(PIN_DIR_MASK, true)?;
    bridge.set_rate(UPLOAD_BITRATE)?;
    bitbang_init(bridge)?;
    write_all(bridge, &stream)?;
    bridge.set_bitbang(PIN_DIR_MASK, false)?;
    bridge.drain()?;

    logic_mode_handshake(bridge)
}

/// Switch the freshly configured netlist into logic-analyzer mode and verify
/// it responds: read the ID register, walk 0x55/0xaa through the scratch
/// register, then request SDRAM initialization.
fn logic_mode_handshake<B: BitbangBridge + ?Sized>(bridge: &mut B) -> Result<()> {
    let mode = proto::WriteMode::SDRAM_INIT.bits();
    let cmd = [
        proto::CMD_ADDR_LOW | (proto::RREG_ID & 0xf),
        proto::CMD_ADDR_HIGH | (proto::RREG_ID >> 4),
        proto::CMD_READ_ADDR,
        proto::CMD_ADDR_LOW | (proto::WREG_TEST & 0xf),
        proto::CMD_DATA_LOW | 0x5,
        proto::CMD_DATA_HIGH_WRITE | 0x5,
        proto::CMD_READ_ADDR,
        proto::CMD_DATA_LOW | 0xa,
        proto::CMD_DATA_HIGH_WRITE | 0xa,
        proto::CMD_READ_ADDR,
        proto::CMD_ADDR_LOW | (proto::WREG_MODE & 0xf),
        proto::CMD_DATA_LOW | (mode & 0xf),
        proto::CMD_DATA_HIGH_WRITE | (mode >> 4),
    ];
    write_all(bridge, &cmd)?;

    let mut response = [0u8; 3];
    read_full(bridge, &mut response, 3)?;
    if response != HANDSHAKE_RESPONSE {
        return Err(Error::Protocol(format!(
            "logic-analyzer handshake answered {:02x?}",
            response
        )));
    }
    debug!("logic-analyzer mode handshake complete");
    Ok(())
}
