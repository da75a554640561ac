//! Bit-level transforms shared by the trigger and decode paths.
//!
//! The encodings here look arbitrary but are load-bearing: the LUT entry
//! layout is what the SIGMA trigger unit actually addresses, and the
//! deinterlace formulae are the exact inverse of how the fast-mode FPGA
//! packs several narrow samples into one 16-bit event.

/// Build the four quad-group LUT vectors for a value/mask condition.
///
/// Each 4-channel group gets a 16-entry truth table over that group's pins:
/// entry `i` stays set iff every masked pin in the group has its value bit
/// equal to the corresponding bit of `i`. ANDing the four groups' outputs
/// yields `(input & mask) == (value & mask)` over all 16 pins.
pub fn build_lut_entry(value: u16, mask: u16) -> [u16; 4] {
    let mut entry = [0xffffu16; 4];
    for (quad, vec) in entry.iter_mut().enumerate() {
        for i in 0..16u16 {
            for k in 0..4u16 {
                let bit = 1u16 << (quad as u16 * 4 + k);
                if mask & bit == 0 {
                    continue;
                }
                let want = value & bit != 0;
                let have = i & (1 << k) != 0;
                if want != have {
                    *vec &= !(1 << i);
                }
            }
        }
    }
    entry
}

/// Evaluate a quad-group LUT bank against a 16-bit pin state.
pub fn lut_entry_matches(entry: &[u16; 4], input: u16) -> bool {
    entry.iter().enumerate().all(|(quad, vec)| {
        let idx = (input >> (quad * 4)) & 0xf;
        vec & (1 << idx) != 0
    })
}

/// Pair-detector condition fed into the glue-logic LUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOp {
    Level,
    Not,
    Rise,
    Fall,
    RiseFall,
    NotRise,
    NotFall,
    NotRiseFall,
}

/// Boolean function combining a detector output into the accumulated mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerFunc {
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Nxor,
}

/// Fold one pair detector into the 16-entry glue-logic mask.
///
/// `index` selects which (previous, current) detector-pair of the LUT
/// address feeds the `x[prev][curr]` table; `neg` transposes the table
/// through `(i, j) <-> (1-i, 1-j)`.
pub fn add_trigger_function(
    op: TriggerOp,
    func: TriggerFunc,
    index: usize,
    neg: bool,
    mask: &mut u16,
) {
    let mut x = [[false; 2]; 2];
    match op {
        TriggerOp::Level => {
            x[0][1] = true;
            x[1][1] = true;
        }
        TriggerOp::Not => {
            x[0][0] = true;
            x[1][0] = true;
        }
        TriggerOp::Rise => x[0][1] = true,
        TriggerOp::Fall => x[1][0] = true,
        TriggerOp::RiseFall => {
            x[0][1] = true;
            x[1][0] = true;
        }
        TriggerOp::NotRise => {
            x[1][1] = true;
            x[0][0] = true;
            x[1][0] = true;
        }
        TriggerOp::NotFall => {
            x[1][1] = true;
            x[0][0] = true;
            x[0][1] = true;
        }
        TriggerOp::NotRiseFall => {
            x[1][1] = true;
            x[0][0] = true;
        }
    }
    if neg {
        let diag = x[0][0];
        x[0][0] = x[1][1];
        x[1][1] = diag;
        let off = x[0][1];
        x[0][1] = x[1][0];
        x[1][0] = off;
    }
    for i in 0..16u16 {
        let a = (i >> (2 * index)) & 1;
        let b = (i >> (2 * index + 1)) & 1;
        let aset = *mask & (1 << i) != 0;
        let bset = x[b as usize][a as usize];
        let rset = match func {
            TriggerFunc::And => aset && bset,
            TriggerFunc::Nand => !(aset && bset),
            TriggerFunc::Or => aset || bset,
            TriggerFunc::Nor => !(aset || bset),
            TriggerFunc::Xor => aset != bset,
            TriggerFunc::Nxor => aset == bset,
        };
        if rset {
            *mask |= 1 << i;
        } else {
            *mask &= !(1 << i);
        }
    }
}

/// Split one 100 MHz event into its two 8-channel samples.
///
/// Bit `2 * channel + sample_index` of the event is bit `channel` of sample
/// `sample_index`.
pub fn deinterlace_100(event: u16, sample_index: usize) -> u16 {
    let data = event >> sample_index;
    let mut out = 0;
    for ch in 0..8 {
        out |= (data >> ch) & (1 << ch);
    }
    out
}

/// Split one 200 MHz event into its four 4-channel samples.
///
/// Bit `4 * channel + sample_index` of the event is bit `channel` of sample
/// `sample_index`.
pub fn deinterlace_200(event: u16, sample_index: usize) -> u16 {
    let data = event >> sample_index;
    let mut out = 0;
    for ch in 0..4 {
        out |= (data >> (3 * ch)) & (1 << ch);
    }
    out
}

/// Inverse of [`deinterlace_100`]; used by the tests and simulators that
/// synthesize fast-mode capture memory.
pub fn interlace_100(samples: [u16; 2]) -> u16 {
    let mut event = 0;
    for (idx, &sample) in samples.iter().enumerate() {
        for ch in 0..8 {
            if sample & (1 << ch) != 0 {
                event |= 1 << (2 * ch + idx);
            }
        }
    }
    event
}

/// Inverse of [`deinterlace_200`].
pub fn interlace_200(samples: [u16; 4]) -> u16 {
    let mut event = 0;
    for (idx, &sample) in samples.iter().enumerate() {
        for ch in 0..4 {
            if sample & (1 << ch) != 0 {
                event |= 1 << (4 * ch + idx);
            }
        }
    }
    event
}
