//! Trigger register synthesis for the Kingst LA family.
//!
//! The FPGA takes the whole trigger intent as four 32-bit words; there is
//! no LUT to build, but the same admissibility rules apply: one stage, any
//! number of level conditions, at most one edge.

use byteorder::{ByteOrder, LittleEndian};

use crate::la2016_proto as proto;
use crate::session::{TriggerMatch, TriggerSpec};
use crate::transport::ControlTransport;
use crate::{Error, Result};

/// The four words consumed by the trigger register, in wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerWords {
    /// Channels participating in the capture.
    pub enabled: u32,
    /// Channels carrying a condition.
    pub triggering: u32,
    /// 1 = level condition, 0 = edge, per triggering channel.
    pub level: u32,
    /// For levels: 1 = high. For edges: 1 = falling.
    pub high_or_falling: u32,
}

impl TriggerWords {
    pub fn use_trigger(&self) -> bool {
        self.triggering != 0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        LittleEndian::write_u32(&mut out[0..4], self.enabled);
        LittleEndian::write_u32(&mut out[4..8], self.triggering);
        LittleEndian::write_u32(&mut out[8..12], self.level);
        LittleEndian::write_u32(&mut out[12..16], self.high_or_falling);
        out
    }
}

/// Flatten the framework trigger description into register words. Matches
/// on disabled channels are dropped; errors happen before any hardware
/// write.
pub fn convert_trigger(
    spec: &TriggerSpec,
    enabled_channels: u32,
    channel_count: usize,
) -> Result<TriggerWords> {
    let mut words = TriggerWords {
        enabled: enabled_channels,
        ..TriggerWords::default()
    };

    let mut stages = spec.stages.iter().filter(|stage| !stage.is_empty());
    let first = match stages.next() {
        Some(stage) => stage,
        None => return Ok(words),
    };
    if stages.next().is_some() {
        return Err(Error::Unsupported("only one trigger stage is supported"));
    }

    for m in first {
        if m.channel >= channel_count {
            return Err(Error::Argument(format!(
                "trigger channel {} out of range",
                m.channel
            )));
        }
        let bit = 1u32 << m.channel;
        if enabled_channels & bit == 0 {
            continue;
        }
        words.triggering |= bit;
        match m.kind {
            TriggerMatch::High => {
                words.level |= bit;
                words.high_or_falling |= bit;
            }
            TriggerMatch::Low => words.level |= bit,
            TriggerMatch::Rising => {}
            TriggerMatch::Falling => words.high_or_falling |= bit,
        }
    }

    let edges = (words.triggering & !words.level).count_ones();
    if edges > 1 {
        return Err(Error::Unsupported("one edge trigger only"));
    }
    Ok(words)
}

/// Ship the words to the FPGA. The register index is what the vendor
/// firmware expects for this particular register.
pub fn write_trigger<T: ControlTransport + ?Sized>(
    transport: &mut T,
    words: &TriggerWords,
) -> Result<()> {
    transport.ctrl_out(
        proto::CMD_FPGA_SPI,
        proto::REG_TRIGGER,
        proto::TRIGGER_REG_INDEX,
        &words.to_bytes(),
    )
}
