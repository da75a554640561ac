//! Capture download and sample reconstruction for the SIGMA family.
//!
//! Sample memory is a ring of 1024-byte rows, each row 64 clusters of one
//! timestamp plus seven events. Quiet stretches emit no clusters at all, so
//! reconstruction replays the previous sample across every timestamp gap;
//! in the 100/200 MHz firmware each event additionally interleaves two or
//! four narrow samples that have to be pulled apart again. The hardware's
//! trigger position is only cluster-accurate and trails the actual match,
//! so the exact sample is re-searched in software across the reported
//! cluster and the one before it.

use log::debug;
use zerocopy::{FromBytes, Unaligned};

use crate::bitops;
use crate::session::{Packet, Session};
use crate::sigma_proto as proto;
use crate::sigma_trigger::TriggerMasks;
use crate::submit::SubmitBuffer;
use crate::transport::BitbangBridge;
use crate::wire::{U16Le, WireRead};
use crate::{Error, Result};

/// One 16-byte sample-memory cluster.
#[derive(FromBytes, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct DramCluster {
    pub timestamp: U16Le,
    pub events: [U16Le; proto::EVENTS_PER_CLUSTER],
}

/// The cluster range the software trigger search covers, in flattened
/// cluster indices (`row * 64 + cluster`). The skew adjustment can move the
/// search start one cluster before the hardware-reported one.
#[derive(Debug, Clone, Copy)]
struct TriggerWindow {
    start_flat: usize,
    /// Cluster holding the hardware-reported position; the search never
    /// runs past it.
    raw_flat: usize,
    /// Event offset within that cluster, kept as the fallback marker
    /// position when no sample matches.
    raw_event: usize,
    done: bool,
}

/// Per-download decoder state.
struct Decoder<'m> {
    samples_per_event: usize,
    masks: &'m TriggerMasks,
    trigger: Option<TriggerWindow>,
    last_sample: u16,
    last_timestamp: u16,
    primed: bool,
}

/// Run one complete download pass: freeze the write side, work out the read
/// window, and stream it row batch by row batch through the decoder. The
/// caller owns the frame bracket around this.
pub(crate) fn download<B, S>(
    bridge: &mut B,
    session: &mut S,
    submit: &mut SubmitBuffer,
    samples_per_event: usize,
    masks: &TriggerMasks,
) -> Result<()>
where
    B: BitbangBridge + ?Sized,
    S: Session,
{
    proto::set_register(
        bridge,
        proto::WREG_MODE,
        proto::WriteMode::SDRAM_READ_EN.bits(),
    )?;
    let pos = proto::read_positions(bridge)?;
    let mode = proto::read_mode(bridge)?;

    let (stop_row, stop_event) = proto::split_position(pos.stop);
    let round = mode.contains(proto::ReadMode::ROUND);
    let triggered = mode.contains(proto::ReadMode::TRIGGERED);

    let (first_row, row_span) = if round {
        // The ring wrapped: resume two rows past the stop line, skipping the
        // one the write pointer may have been mangling, and cover the rest
        // of the ring back up to the stop line.
        ((stop_row + 2) % proto::ROW_COUNT, proto::ROW_COUNT - 2)
    } else {
        (0, stop_row + 1)
    };

    let trigger = if triggered {
        let (row, raw_event) = proto::split_position(pos.trigger);
        let raw_event = raw_event.min(proto::EVENTS_PER_ROW - 1);
        let mut search_event = raw_event;
        if samples_per_event == 1 {
            // The latched position trails the match by up to a cluster.
            search_event -= search_event.min(6);
        }
        let base = row * proto::CLUSTERS_PER_ROW;
        Some(TriggerWindow {
            start_flat: base + search_event / proto::EVENTS_PER_CLUSTER,
            raw_flat: base + raw_event / proto::EVENTS_PER_CLUSTER,
            raw_event: raw_event % proto::EVENTS_PER_CLUSTER,
            done: false,
        })
    } else {
        None
    };
    debug!(
        "download window: {} rows from row {}, stop event {}, trigger {:?}",
        row_span, first_row, stop_event, trigger
    );

    let mut decoder = Decoder {
        samples_per_event,
        masks,
        trigger,
        last_sample: 0,
        last_timestamp: 0,
        primed: false,
    };
    let mut buf = vec![0u8; proto::MAX_DRAM_BATCH * proto::ROW_LENGTH_BYTES];
    let mut rows_done = 0;
    while rows_done < row_span {
        let start = (first_row + rows_done) % proto::ROW_COUNT;
        let batch = proto::MAX_DRAM_BATCH
            .min(row_span - rows_done)
            .min(proto::ROW_COUNT - start);
        proto::read_dram(bridge, start as u16, batch, &mut buf)?;
        for i in 0..batch {
            let is_last = rows_done + i + 1 == row_span;
            // Only an unwrapped capture ends inside a row; a wrapped window
            // ends on the last complete row before the stop line.
            let events_in_row = if is_last && !round {
                stop_event.min(proto::EVENTS_PER_ROW)
            } else {
                proto::EVENTS_PER_ROW
            };
            let row = &buf[i * proto::ROW_LENGTH_BYTES..(i + 1) * proto::ROW_LENGTH_BYTES];
            decoder.decode_row(session, submit, row, start + i, events_in_row)?;
        }
        rows_done += batch;
    }

    submit.flush(session)?;
    Ok(())
}

impl<'m> Decoder<'m> {
    fn decode_row<S: Session>(
        &mut self,
        session: &mut S,
        submit: &mut SubmitBuffer,
        row: &[u8],
        row_index: usize,
        events_in_row: usize,
    ) -> Result<()> {
        let clusters = row
            .read_slice_at::<DramCluster>(0, proto::CLUSTERS_PER_ROW)
            .ok_or(Error::Bug("sample row shorter than its cluster count"))?;
        for (ci, cluster) in clusters.iter().enumerate() {
            let consumed = ci * proto::EVENTS_PER_CLUSTER;
            if consumed >= events_in_row {
                break;
            }
            let events = (events_in_row - consumed).min(proto::EVENTS_PER_CLUSTER);
            let flat = row_index * proto::CLUSTERS_PER_ROW + ci;
            self.decode_cluster(session, submit, cluster, events, flat)?;
        }
        Ok(())
    }

    fn decode_cluster<S: Session>(
        &mut self,
        session: &mut S,
        submit: &mut SubmitBuffer,
        cluster: &DramCluster,
        events: usize,
        flat: usize,
    ) -> Result<()> {
        let ts = cluster.timestamp.get();
        if !self.primed {
            self.last_timestamp = ts;
            self.primed = true;
        }

        // Quiet time: no cluster was stored while no pin changed, so the
        // previous sample repeats across the whole gap. The trigger cannot
        // sit in here, a match would have produced a cluster.
        let gap = ts.wrapping_sub(self.last_timestamp);
        if gap > 0 {
            submit.push_run(
                session,
                self.last_sample,
                u64::from(gap) * self.samples_per_event as u64,
            )?;
        }

        // Within the trigger search window the fallback offset only applies
        // on its last cluster; earlier candidates just keep searching.
        let search = match self.trigger {
            Some(w) if !w.done && flat >= w.start_flat && flat <= w.raw_flat => {
                if flat == w.raw_flat {
                    Some(Some(w.raw_event))
                } else {
                    Some(None)
                }
            }
            _ => None,
        };

        if let Some(fallback) = search {
            let emitted = self.decode_search_cluster(session, submit, cluster, events, fallback)?;
            if emitted {
                if let Some(w) = self.trigger.as_mut() {
                    w.done = true;
                }
            }
        } else {
            for e in 0..events {
                let data = cluster.events[e].get();
                self.emit_event(session, submit, data)?;
            }
        }
        self.last_timestamp = ts.wrapping_add(proto::EVENTS_PER_CLUSTER as u16);
        Ok(())
    }

    fn emit_event<S: Session>(
        &mut self,
        session: &mut S,
        submit: &mut SubmitBuffer,
        data: u16,
    ) -> Result<()> {
        match self.samples_per_event {
            1 => {
                submit.push(session, data)?;
                self.last_sample = data;
            }
            2 => {
                for idx in 0..2 {
                    let sample = bitops::deinterlace_100(data, idx);
                    submit.push(session, sample)?;
                    self.last_sample = sample;
                }
            }
            4 => {
                for idx in 0..4 {
                    let sample = bitops::deinterlace_200(data, idx);
                    submit.push(session, sample)?;
                    self.last_sample = sample;
                }
            }
            _ => return Err(Error::Bug("invalid samples-per-event")),
        }
        Ok(())
    }

    fn decode_into_scratch(
        &self,
        cluster: &DramCluster,
        events: usize,
        scratch: &mut [u16; proto::EVENTS_PER_CLUSTER * 4],
    ) -> Result<usize> {
        let mut n = 0;
        for e in 0..events {
            let data = cluster.events[e].get();
            match self.samples_per_event {
                1 => {
                    scratch[n] = data;
                    n += 1;
                }
                2 => {
                    for idx in 0..2 {
                        scratch[n] = bitops::deinterlace_100(data, idx);
                        n += 1;
                    }
                }
                4 => {
                    for idx in 0..4 {
                        scratch[n] = bitops::deinterlace_200(data, idx);
                        n += 1;
                    }
                }
                _ => return Err(Error::Bug("invalid samples-per-event")),
            }
        }
        Ok(n)
    }

    /// Decode a trigger-candidate cluster into a scratch array, search it
    /// for the exact matching sample, and if one is found (or the fallback
    /// applies) bracket the trigger marker between the pre- and
    /// post-trigger parts. Returns whether the marker went out.
    fn decode_search_cluster<S: Session>(
        &mut self,
        session: &mut S,
        submit: &mut SubmitBuffer,
        cluster: &DramCluster,
        events: usize,
        fallback: Option<usize>,
    ) -> Result<bool> {
        let mut scratch = [0u16; proto::EVENTS_PER_CLUSTER * 4];
        let n = self.decode_into_scratch(cluster, events, &mut scratch)?;

        let found = find_trigger_offset(self.masks, self.last_sample, &scratch[..n]);
        let offset = match (found, fallback) {
            (Some(offset), _) => Some(offset),
            (None, Some(event_offset)) => {
                Some((event_offset * self.samples_per_event).min(n.saturating_sub(1)))
            }
            (None, None) => None,
        };

        match offset {
            Some(offset) => {
                debug!("trigger pinpointed at sample {} of its cluster", offset);
                for &sample in &scratch[..offset] {
                    submit.push(session, sample)?;
                }
                submit.flush(session)?;
                session.send(Packet::Trigger)?;
                for &sample in &scratch[offset..n] {
                    submit.push(session, sample)?;
                }
                if n > 0 {
                    self.last_sample = scratch[n - 1];
                }
                Ok(true)
            }
            None => {
                for &sample in &scratch[..n] {
                    submit.push(session, sample)?;
                }
                if n > 0 {
                    self.last_sample = scratch[n - 1];
                }
                Ok(false)
            }
        }
    }
}

/// Find the first sample satisfying the trigger condition, sliding the
/// previous-sample window from `prev` onward. `None` when nothing matches.
fn find_trigger_offset(masks: &TriggerMasks, mut prev: u16, samples: &[u16]) -> Option<usize> {
    for (i, &sample) in samples.iter().enumerate() {
        if masks.sample_matches(prev, sample) {
            return Some(i);
        }
        prev = sample;
    }
    None
}
