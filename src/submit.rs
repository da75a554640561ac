//! Bounded accumulation of decoded samples between framework submissions.
//!
//! Decoders emit samples one at a time or in runs; the buffer batches them
//! into logic packets of a bounded size and enforces the user's sample
//! limit at single-sample granularity, so the limit is hit exactly no
//! matter how the decode slices its input.

use byteorder::{ByteOrder, LittleEndian};

use crate::session::{Packet, Session};
use crate::{Error, Result};

/// Accumulated payload size that forces a flush on its own.
const CHUNK_BYTES: usize = 4 * 1024 * 1024;

pub struct SubmitBuffer {
    unit_size: usize,
    /// `None` means unlimited.
    limit: Option<u64>,
    /// Samples accepted so far, including those not yet flushed.
    accepted: u64,
    data: Vec<u8>,
}

impl SubmitBuffer {
    /// `limit_samples == 0` means unlimited up to the device's own capacity.
    pub fn new(unit_size: usize, limit_samples: u64) -> Self {
        debug_assert!(unit_size == 2 || unit_size == 4);
        SubmitBuffer {
            unit_size,
            limit: if limit_samples == 0 {
                None
            } else {
                Some(limit_samples)
            },
            accepted: 0,
            data: Vec::new(),
        }
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Samples accepted so far, flushed or not.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// True once the user limit has been reached; further pushes are
    /// silently dropped.
    pub fn limit_reached(&self) -> bool {
        match self.limit {
            Some(limit) => self.accepted >= limit,
            None => false,
        }
    }

    fn remaining(&self) -> u64 {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.accepted),
            None => u64::MAX,
        }
    }

    /// Append one sample unit.
    pub fn push<S: Session>(&mut self, session: &mut S, sample: u16) -> Result<()> {
        self.push_run(session, sample, 1)
    }

    /// Append `count` copies of `sample`, truncating at the user limit.
    pub fn push_run<S: Session>(&mut self, session: &mut S, sample: u16, count: u64) -> Result<()> {
        let count = count.min(self.remaining());
        if count == 0 {
            return Ok(());
        }
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, sample);
        for _ in 0..count {
            self.data.extend_from_slice(&bytes);
            if self.unit_size == 4 {
                self.data.extend_from_slice(&[0, 0]);
            }
            if self.data.len() >= CHUNK_BYTES {
                self.flush(session)?;
            }
        }
        self.accepted += count;
        Ok(())
    }

    /// Send everything accumulated as one logic packet.
    pub fn flush<S: Session>(&mut self, session: &mut S) -> Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }
        if self.data.len() % self.unit_size != 0 {
            return Err(Error::Bug("submit buffer holds a partial sample unit"));
        }
        session.send(Packet::Logic {
            unit_size: self.unit_size,
            data: &self.data,
        })?;
        self.data.clear();
        Ok(())
    }
}
