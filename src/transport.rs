//! Transport abstraction over the USB bridge chips.
//!
//! The framework hands each device an exclusively owned transport; the
//! engines never enumerate USB themselves. Two bridge flavors exist: the
//! FTDI bitbang/FIFO bridge in front of the SIGMA FPGA, and the Cypress FX2
//! in front of the LA2016 FPGA. Everything is blocking with a common
//! timeout; a read that returns zero bytes means the timeout expired with
//! nothing available, which is an error during bring-up but routine while
//! waiting for capture data.

use std::time::Duration;

use crate::{Error, Result};

/// Default timeout for a single bulk read/write or control transfer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

/// Blocking bulk I/O.
pub trait Transport {
    /// Read up to `buf.len()` bytes. Returns the number of bytes read;
    /// zero means the timeout expired.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `data`, returning the number of bytes the bridge accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize>;
}

/// Vendor control requests of the FX2-style bridge (LA2016 family).
/// Short transfers are an error in both directions.
pub trait ControlTransport: Transport {
    fn ctrl_in(&mut self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<()>;

    fn ctrl_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()>;
}

/// Mode switching of the FTDI bridge (SIGMA family).
pub trait BitbangBridge: Transport {
    /// Put the data pins under direct host control (`enable`) with the given
    /// output-direction mask, or return to the framed FIFO mode.
    fn set_bitbang(&mut self, pin_mask: u8, enable: bool) -> Result<()>;

    /// Set the bitbang clock rate in bits per second.
    fn set_rate(&mut self, bits_per_second: u32) -> Result<()>;

    /// Discard anything buffered inside the bridge, both directions.
    fn drain(&mut self) -> Result<()>;
}

/// Write all of `data`, treating a short write as an I/O error.
pub fn write_all<T: Transport + ?Sized>(transport: &mut T, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        let n = transport.write(&data[written..])?;
        if n == 0 {
            return Err(Error::Io(format!(
                "bridge accepted {} of {} bytes",
                written,
                data.len()
            )));
        }
        written += n;
    }
    Ok(())
}

/// Fill `buf` completely, tolerating up to `max_empty_reads` consecutive
/// timed-out reads before giving up.
pub fn read_full<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    max_empty_reads: usize,
) -> Result<()> {
    let mut filled = 0;
    let mut empty = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..])?;
        if n == 0 {
            empty += 1;
            if empty > max_empty_reads {
                return Err(Error::Timeout("read stalled"));
            }
            continue;
        }
        empty = 0;
        filled += n;
    }
    Ok(())
}
