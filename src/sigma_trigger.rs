//! Hardware trigger synthesis for the SIGMA FPGA.
//!
//! Below 100 MHz the trigger unit is a bank of 16-entry look-up tables over
//! the pin state plus glue logic; the 100/200 MHz firmware instead watches a
//! single pin for one edge. Both forms are derived from the same reduced
//! mask representation of the framework's trigger description.

use byteorder::{ByteOrder, LittleEndian};

use crate::bitops::{self, TriggerFunc, TriggerOp};
use crate::session::{TriggerMatch, TriggerSpec};
use crate::sigma_proto as proto;
use crate::transport::BitbangBridge;
use crate::{Error, Result};

/// The framework trigger description reduced to per-channel masks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMasks {
    pub rising: u16,
    pub falling: u16,
    /// Wanted level per masked channel.
    pub value: u16,
    /// Channels with a level condition.
    pub mask: u16,
    /// False when the description contains no condition at all.
    pub enabled: bool,
}

impl TriggerMasks {
    /// True when `curr`, seen after `prev`, satisfies every level and edge
    /// condition at once.
    pub fn sample_matches(&self, prev: u16, curr: u16) -> bool {
        (curr & self.mask) == (self.value & self.mask)
            && (prev & self.rising) == 0
            && (curr & self.rising) == self.rising
            && (prev & self.falling) == self.falling
            && (curr & self.falling) == 0
    }
}

/// Reduce a framework trigger description, applying the admissibility rules
/// of the current sampling mode. Matches on disabled channels are dropped.
/// Fails before anything is written to hardware.
pub fn convert_trigger(
    spec: &TriggerSpec,
    enabled_channels: u16,
    fast_mode: bool,
) -> Result<TriggerMasks> {
    let mut masks = TriggerMasks::default();
    let mut stages = spec.stages.iter().filter(|stage| !stage.is_empty());
    let first = match stages.next() {
        Some(stage) => stage,
        None => return Ok(masks),
    };
    if stages.next().is_some() {
        return Err(Error::Unsupported("only one trigger stage is supported"));
    }

    for m in first {
        if m.channel >= 16 {
            return Err(Error::Argument(format!(
                "trigger channel {} out of range",
                m.channel
            )));
        }
        let bit = 1u16 << m.channel;
        if enabled_channels & bit == 0 {
            continue;
        }
        match m.kind {
            TriggerMatch::High => {
                masks.mask |= bit;
                masks.value |= bit;
            }
            TriggerMatch::Low => masks.mask |= bit,
            TriggerMatch::Rising => masks.rising |= bit,
            TriggerMatch::Falling => masks.falling |= bit,
        }
    }

    let edges = (masks.rising | masks.falling).count_ones();
    if edges > 1 {
        return Err(Error::Unsupported("only one edge trigger is supported"));
    }
    if fast_mode {
        if masks.mask != 0 {
            return Err(Error::Unsupported(
                "level triggers are not supported in the 100/200 MHz modes",
            ));
        }
        if edges != 1 {
            return Err(Error::Unsupported(
                "the 100/200 MHz modes trigger on exactly one edge",
            ));
        }
    }
    masks.enabled = masks.mask != 0 || edges != 0;
    Ok(masks)
}

/// Parameter block appended to the LUT upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LutParams {
    pub selinc: u8,
    pub selres: u8,
    pub sela: u8,
    pub selb: u8,
    pub selc: u8,
    pub selpresc: u8,
    pub cmpa: u16,
    pub cmpb: u16,
}

impl LutParams {
    /// Pack into the 6-byte register image: a bit-packed selector word
    /// followed by the two comparator values, all little-endian.
    pub fn pack(&self) -> [u8; 6] {
        let selector = u16::from(self.selc & 0x3)
            | u16::from(self.selpresc & 0x3f) << 2
            | u16::from(self.selinc & 0x3) << 8
            | u16::from(self.selres & 0x3) << 10
            | u16::from(self.sela & 0x3) << 12
            | u16::from(self.selb & 0x3) << 14;
        let mut out = [0u8; 6];
        LittleEndian::write_u16(&mut out[..2], selector);
        LittleEndian::write_u16(&mut out[2..4], self.cmpb);
        LittleEndian::write_u16(&mut out[4..6], self.cmpa);
        out
    }
}

/// The trigger unit's LUT bank: per-quad level and edge tables plus glue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerLut {
    pub m0d: [u16; 4],
    pub m1d: [u16; 4],
    pub m2d: [u16; 4],
    pub m3: u16,
    pub m3s: u16,
    pub m4: u16,
    pub params: LutParams,
}

/// Build the LUT bank for a level/edge condition in the 50 MHz firmware.
pub fn build_basic_lut(masks: &TriggerMasks) -> TriggerLut {
    let mut lut = TriggerLut::default();
    lut.m4 = 0xa000;
    lut.m3 = 0xffff;
    lut.m2d = bitops::build_lut_entry(masks.value, masks.mask);
    if masks.rising != 0 {
        lut.m0d = bitops::build_lut_entry(masks.rising, masks.rising);
    }
    if masks.falling != 0 {
        lut.m1d = bitops::build_lut_entry(masks.falling, masks.falling);
    }
    if masks.rising != 0 || masks.falling != 0 {
        lut.m3 = 0;
        if masks.rising != 0 {
            bitops::add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, 0, false, &mut lut.m3);
        }
        if masks.falling != 0 {
            bitops::add_trigger_function(TriggerOp::Fall, TriggerFunc::Or, 1, false, &mut lut.m3);
        }
    }
    // Event-type trigger.
    lut.params.selres = 3;
    lut
}

/// Transpose the LUT into per-address slices and stream it to the FPGA:
/// each of the 16 addresses gets its two data bytes written to the select
/// register followed by a write strobe, then the parameter block goes out.
pub fn write_lut<B: BitbangBridge + ?Sized>(bridge: &mut B, lut: &TriggerLut) -> Result<()> {
    for addr in 0..16u8 {
        let bit = 1u16 << addr;
        let mut entry = [0u8; 2];
        for quad in 0..4 {
            if lut.m2d[quad] & bit != 0 {
                entry[0] |= 1 << quad;
            }
            if lut.m1d[quad] & bit != 0 {
                entry[0] |= 1 << (4 + quad);
            }
            if lut.m0d[quad] & bit != 0 {
                entry[1] |= 1 << quad;
            }
        }
        if lut.m3 & bit != 0 {
            entry[1] |= 0x10;
        }
        if lut.m3s & bit != 0 {
            entry[1] |= 0x20;
        }
        if lut.m4 & bit != 0 {
            entry[1] |= 0x40;
        }
        proto::write_register(bridge, proto::WREG_TRIGGER_SELECT, &entry)?;
        proto::set_register(
            bridge,
            proto::WREG_TRIGGER_SELECT2,
            proto::TRGSEL2_RESET | proto::TRGSEL2_LUT_WRITE | (addr & proto::TRGSEL2_LUT_ADDR_MASK),
        )?;
    }
    proto::write_register(bridge, proto::WREG_TRIGGER_SELECT, &lut.params.pack())
}

/// Register value for the single-pin edge trigger of the 100/200 MHz
/// firmware. The polarity bit is inverted in hardware: setting "rise"
/// selects falling input edges.
pub fn fast_trigger_value(masks: &TriggerMasks, channel_count: usize) -> Result<u8> {
    let edge = masks.rising | masks.falling;
    if edge.count_ones() != 1 {
        return Err(Error::Bug("fast trigger needs exactly one edge"));
    }
    let pin = edge.trailing_zeros() as usize;
    if pin >= channel_count {
        return Err(Error::Unsupported(
            "trigger channel not sampled at this samplerate",
        ));
    }
    let mut value = (pin as u8 & proto::TRGSEL2_PIN_MASK) | proto::TRGSEL2_LEDSEL1;
    if masks.falling != 0 {
        value |= proto::TRGSEL2_PINPOL_RISE;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitops::lut_entry_matches;
    use crate::session::ChannelMatch;

    fn spec_of(matches: &[(usize, TriggerMatch)]) -> TriggerSpec {
        TriggerSpec::single_stage(
            matches
                .iter()
                .map(|&(channel, kind)| ChannelMatch { channel, kind })
                .collect(),
        )
    }

    #[test]
    fn value_and_one_edge_is_admissible_at_50mhz() {
        let spec = spec_of(&[
            (0, TriggerMatch::High),
            (1, TriggerMatch::Low),
            (3, TriggerMatch::Rising),
        ]);
        let masks = convert_trigger(&spec, 0xffff, false).unwrap();
        assert!(masks.enabled);
        assert_eq!(masks.mask, 0x0003);
        assert_eq!(masks.value, 0x0001);
        assert_eq!(masks.rising, 0x0008);
        assert_eq!(masks.falling, 0x0000);
    }

    #[test]
    fn two_edges_are_rejected() {
        let spec = spec_of(&[(0, TriggerMatch::Rising), (1, TriggerMatch::Falling)]);
        assert!(matches!(
            convert_trigger(&spec, 0xffff, false),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn second_stage_is_rejected() {
        let mut spec = spec_of(&[(0, TriggerMatch::High)]);
        spec.stages.push(vec![ChannelMatch {
            channel: 1,
            kind: TriggerMatch::Low,
        }]);
        assert!(matches!(
            convert_trigger(&spec, 0xffff, false),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn fast_mode_rejects_levels_and_requires_an_edge() {
        let level = spec_of(&[(0, TriggerMatch::High)]);
        assert!(matches!(
            convert_trigger(&level, 0xffff, true),
            Err(Error::Unsupported(_))
        ));
        // No trigger at all stays admissible: the capture just runs free.
        let nothing = spec_of(&[]);
        assert!(!convert_trigger(&nothing, 0xffff, true).unwrap().enabled);
        let edge = spec_of(&[(2, TriggerMatch::Falling)]);
        let masks = convert_trigger(&edge, 0xffff, true).unwrap();
        assert_eq!(masks.falling, 0x0004);
    }

    #[test]
    fn disabled_channels_are_ignored() {
        let spec = spec_of(&[(0, TriggerMatch::High), (5, TriggerMatch::Rising)]);
        let masks = convert_trigger(&spec, !(1 << 5) & 0xffff, false).unwrap();
        assert_eq!(masks.rising, 0);
        assert_eq!(masks.mask, 0x0001);
        assert!(masks.enabled);
    }

    #[test]
    fn empty_description_disables_triggering() {
        let masks = convert_trigger(&TriggerSpec::none(), 0xffff, false).unwrap();
        assert!(!masks.enabled);
    }

    #[test]
    fn level_lut_encodes_the_value_mask_predicate() {
        let masks = TriggerMasks {
            value: 0x0041,
            mask: 0x00c1,
            ..TriggerMasks::default()
        };
        let lut = build_basic_lut(&masks);
        for input in 0..=0xffffu32 {
            let input = input as u16;
            assert_eq!(
                lut_entry_matches(&lut.m2d, input),
                (input & masks.mask) == (masks.value & masks.mask)
            );
        }
        // No edges: glue stays wide open, constant tail as wired.
        assert_eq!(lut.m3, 0xffff);
        assert_eq!(lut.m4, 0xa000);
        assert_eq!(lut.params.selres, 3);
    }

    #[test]
    fn edge_luts_feed_the_glue() {
        let masks = TriggerMasks {
            rising: 0x0008,
            ..TriggerMasks::default()
        };
        let lut = build_basic_lut(&masks);
        // The edge table follows pin 3 itself.
        for input in 0..=0xffffu32 {
            let input = input as u16;
            assert_eq!(lut_entry_matches(&lut.m0d, input), input & 0x0008 != 0);
        }
        // Glue: rise detector on pair 0.
        let mut expected = 0;
        bitops::add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, 0, false, &mut expected);
        assert_eq!(lut.m3, expected);
    }

    #[test]
    fn lut_params_pack_little_endian() {
        let params = LutParams {
            selres: 3,
            selc: 1,
            selpresc: 0x15,
            cmpa: 0x1234,
            cmpb: 0xfedc,
            ..LutParams::default()
        };
        let packed = params.pack();
        let selector = u16::from_le_bytes([packed[0], packed[1]]);
        assert_eq!(selector & 0x3, 1);
        assert_eq!(selector >> 2 & 0x3f, 0x15);
        assert_eq!(selector >> 10 & 0x3, 3);
        assert_eq!(&packed[2..4], &0xfedcu16.to_le_bytes());
        assert_eq!(&packed[4..6], &0x1234u16.to_le_bytes());
    }

    #[test]
    fn fast_trigger_value_encodes_pin_and_polarity() {
        let rising = TriggerMasks {
            rising: 1 << 5,
            ..TriggerMasks::default()
        };
        let value = fast_trigger_value(&rising, 8).unwrap();
        assert_eq!(value & proto::TRGSEL2_PIN_MASK, 5);
        assert_eq!(value & proto::TRGSEL2_PINPOL_RISE, 0);
        assert_eq!(value & proto::TRGSEL2_LEDSEL1, proto::TRGSEL2_LEDSEL1);

        let falling = TriggerMasks {
            falling: 1 << 2,
            ..TriggerMasks::default()
        };
        let value = fast_trigger_value(&falling, 4).unwrap();
        assert_eq!(value & proto::TRGSEL2_PIN_MASK, 2);
        assert_ne!(value & proto::TRGSEL2_PINPOL_RISE, 0);

        // Pin 5 is not sampled in the 4-channel 200 MHz mode.
        assert!(matches!(
            fast_trigger_value(&rising, 4),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn sample_match_combines_level_and_edges() {
        let masks = TriggerMasks {
            mask: 0x0001,
            value: 0x0001,
            rising: 0x0008,
            enabled: true,
            ..TriggerMasks::default()
        };
        assert!(masks.sample_matches(0x0001, 0x0009));
        // Level not satisfied.
        assert!(!masks.sample_matches(0x0000, 0x0008));
        // Edge already high before.
        assert!(!masks.sample_matches(0x0009, 0x0009));
    }
}
