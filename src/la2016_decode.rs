//! Capture retrieval and sample reconstruction for the Kingst LA family.
//!
//! Memory captures come back as a stream of 16-byte transfer packets, each
//! holding five run-length pairs and a sequence byte; the repetition counts
//! play the role the cluster timestamps play on the SIGMA. Streaming
//! captures bypass the on-device compression entirely: every 16-bit memory
//! cell then carries one enabled channel's samples, cells cycling through
//! the enabled channels, and the host rebuilds multi-channel samples
//! bit by bit.

use std::convert::TryInto;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::la2016_proto as proto;
use crate::session::{Packet, Session};
use crate::submit::SubmitBuffer;
use crate::{Error, Result};

/// Decoder state for the run-length packet stream.
pub(crate) struct PacketDecoder {
    /// Run-length pairs left before the trigger marker goes out. `None`
    /// when no trigger applies or the marker is already out.
    pairs_until_trigger: Option<u64>,
    last_sequence: Option<u8>,
    /// Carries a partial packet across chunk boundaries.
    carry: Vec<u8>,
}

impl PacketDecoder {
    pub(crate) fn new(pairs_until_trigger: Option<u64>) -> Self {
        PacketDecoder {
            pairs_until_trigger,
            last_sequence: None,
            carry: Vec::new(),
        }
    }

    /// Feed raw bulk bytes. Complete packets are decoded, the remainder is
    /// carried into the next call.
    pub(crate) fn process<S: Session>(
        &mut self,
        session: &mut S,
        submit: &mut SubmitBuffer,
        data: &[u8],
    ) -> Result<()> {
        let mut input = data;
        if !self.carry.is_empty() {
            let missing = proto::TRANSFER_PACKET_BYTES - self.carry.len();
            let take = missing.min(input.len());
            self.carry.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.carry.len() < proto::TRANSFER_PACKET_BYTES {
                return Ok(());
            }
            let packet: [u8; proto::TRANSFER_PACKET_BYTES] = self.carry[..]
                .try_into()
                .map_err(|_| Error::Bug("carry buffer size"))?;
            self.carry.clear();
            self.decode_packet(session, submit, &packet)?;
        }

        let mut packets = input.chunks_exact(proto::TRANSFER_PACKET_BYTES);
        for packet in &mut packets {
            let packet: [u8; proto::TRANSFER_PACKET_BYTES] = packet
                .try_into()
                .map_err(|_| Error::Bug("packet chunk size"))?;
            self.decode_packet(session, submit, &packet)?;
        }
        self.carry.extend_from_slice(packets.remainder());
        Ok(())
    }

    fn decode_packet<S: Session>(
        &mut self,
        session: &mut S,
        submit: &mut SubmitBuffer,
        packet: &[u8; proto::TRANSFER_PACKET_BYTES],
    ) -> Result<()> {
        let sequence = packet[proto::TRANSFER_PACKET_BYTES - 1];
        if let Some(previous) = self.last_sequence {
            if sequence != previous.wrapping_add(1) {
                // Data loss on the bulk pipe; keep decoding what arrived.
                warn!("transfer sequence jumped from {} to {}", previous, sequence);
            }
        }
        self.last_sequence = Some(sequence);

        for pair in packet[..proto::RLE_PAIRS_PER_PACKET * proto::RLE_PAIR_BYTES]
            .chunks_exact(proto::RLE_PAIR_BYTES)
        {
            if self.pairs_until_trigger == Some(0) {
                submit.flush(session)?;
                session.send(Packet::Trigger)?;
                self.pairs_until_trigger = None;
            }
            let value = LittleEndian::read_u16(&pair[..2]);
            let repetitions = u64::from(pair[2]);
            // Zero repetitions marks unused padding in the final packet.
            if repetitions > 0 {
                submit.push_run(session, value, repetitions)?;
            }
            if let Some(n) = self.pairs_until_trigger.as_mut() {
                *n = n.saturating_sub(1);
            }
        }
        Ok(())
    }
}

/// Streaming-mode reconstruction. Enabled channels occupy consecutive
/// 16-bit cells in a repeating cycle; bit `b` of a cell contributes the
/// cell's channel to reconstructed sample `b` of the current 16-sample
/// block.
pub(crate) struct StreamDecoder {
    channel_bits: Vec<u16>,
    cell_index: usize,
    accumulator: [u16; 16],
    pending_byte: Option<u8>,
    last_flush: Instant,
    flush_interval: Duration,
}

impl StreamDecoder {
    pub(crate) fn new(enabled_channels: u16, flush_interval: Duration) -> Self {
        let channel_bits = (0..16)
            .filter(|ch| enabled_channels & (1 << ch) != 0)
            .map(|ch| 1u16 << ch)
            .collect();
        StreamDecoder {
            channel_bits,
            cell_index: 0,
            accumulator: [0; 16],
            pending_byte: None,
            last_flush: Instant::now(),
            flush_interval,
        }
    }

    pub(crate) fn process<S: Session>(
        &mut self,
        session: &mut S,
        submit: &mut SubmitBuffer,
        data: &[u8],
    ) -> Result<()> {
        let mut bytes = data.iter().copied();
        if let Some(low) = self.pending_byte.take() {
            match bytes.next() {
                Some(high) => self.feed_cell(session, submit, LittleEndian::read_u16(&[low, high]))?,
                None => {
                    self.pending_byte = Some(low);
                    return Ok(());
                }
            }
        }
        loop {
            let low = match bytes.next() {
                Some(byte) => byte,
                None => break,
            };
            let high = match bytes.next() {
                Some(byte) => byte,
                None => {
                    self.pending_byte = Some(low);
                    break;
                }
            };
            self.feed_cell(session, submit, LittleEndian::read_u16(&[low, high]))?;
        }

        // Slow streams still become visible at a bounded latency.
        if self.last_flush.elapsed() >= self.flush_interval {
            submit.flush(session)?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    fn feed_cell<S: Session>(
        &mut self,
        session: &mut S,
        submit: &mut SubmitBuffer,
        cell: u16,
    ) -> Result<()> {
        let channel_bit = self.channel_bits[self.cell_index];
        for (slot, sample) in self.accumulator.iter_mut().enumerate() {
            if cell & (1 << slot) != 0 {
                *sample |= channel_bit;
            }
        }
        self.cell_index += 1;
        if self.cell_index == self.channel_bits.len() {
            for i in 0..self.accumulator.len() {
                submit.push(session, self.accumulator[i])?;
            }
            self.accumulator = [0; 16];
            self.cell_index = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectingSession {
        samples: Vec<u16>,
        trigger_at: Option<usize>,
    }

    impl Session for CollectingSession {
        fn send(&mut self, packet: Packet<'_>) -> Result<()> {
            match packet {
                Packet::Logic { data, .. } => {
                    for pair in data.chunks_exact(2) {
                        self.samples.push(u16::from_le_bytes([pair[0], pair[1]]));
                    }
                }
                Packet::Trigger => self.trigger_at = Some(self.samples.len()),
                _ => {}
            }
            Ok(())
        }
    }

    fn packet(pairs: &[(u16, u8)], sequence: u8) -> [u8; 16] {
        assert!(pairs.len() <= 5);
        let mut out = [0u8; 16];
        for (i, &(value, reps)) in pairs.iter().enumerate() {
            out[i * 3..i * 3 + 2].copy_from_slice(&value.to_le_bytes());
            out[i * 3 + 2] = reps;
        }
        out[15] = sequence;
        out
    }

    #[test]
    fn run_lengths_expand_and_padding_is_skipped() {
        let mut session = CollectingSession::default();
        let mut submit = SubmitBuffer::new(2, 0);
        let mut decoder = PacketDecoder::new(None);

        let data = packet(&[(0xaaaa, 3), (0xbbbb, 1), (0x0000, 0)], 0);
        decoder.process(&mut session, &mut submit, &data).unwrap();
        submit.flush(&mut session).unwrap();
        assert_eq!(
            session.samples,
            vec![0xaaaa, 0xaaaa, 0xaaaa, 0xbbbb]
        );
    }

    #[test]
    fn trigger_marker_lands_between_pairs() {
        let mut session = CollectingSession::default();
        let mut submit = SubmitBuffer::new(2, 0);
        // Two pairs precede the trigger.
        let mut decoder = PacketDecoder::new(Some(2));

        let data = packet(&[(0x1111, 2), (0x2222, 2), (0x3333, 2)], 0);
        decoder.process(&mut session, &mut submit, &data).unwrap();
        submit.flush(&mut session).unwrap();
        assert_eq!(session.trigger_at, Some(4));
        assert_eq!(session.samples.len(), 6);
    }

    #[test]
    fn packets_reassemble_across_chunk_boundaries() {
        let mut session = CollectingSession::default();
        let mut submit = SubmitBuffer::new(2, 0);
        let mut decoder = PacketDecoder::new(None);

        let data = packet(&[(0x5a5a, 4)], 7);
        decoder
            .process(&mut session, &mut submit, &data[..5])
            .unwrap();
        decoder
            .process(&mut session, &mut submit, &data[5..])
            .unwrap();
        submit.flush(&mut session).unwrap();
        assert_eq!(session.samples, vec![0x5a5a; 4]);
    }

    #[test]
    fn sequence_gaps_do_not_stop_decoding() {
        let mut session = CollectingSession::default();
        let mut submit = SubmitBuffer::new(2, 0);
        let mut decoder = PacketDecoder::new(None);

        let first = packet(&[(0x0001, 1)], 0);
        let third = packet(&[(0x0002, 1)], 2);
        decoder.process(&mut session, &mut submit, &first).unwrap();
        decoder.process(&mut session, &mut submit, &third).unwrap();
        submit.flush(&mut session).unwrap();
        assert_eq!(session.samples, vec![0x0001, 0x0002]);
    }

    #[test]
    fn stream_cells_cycle_through_enabled_channels() {
        let mut session = CollectingSession::default();
        let mut submit = SubmitBuffer::new(2, 0);
        // Channels 0 and 2 enabled.
        let mut decoder = StreamDecoder::new(0x0005, Duration::from_secs(3600));

        // Channel 0 high on samples 0 and 1, channel 2 high on sample 15.
        let cells = [0x0003u16, 0x8000u16];
        let mut data = Vec::new();
        for cell in cells.iter() {
            data.extend_from_slice(&cell.to_le_bytes());
        }
        decoder.process(&mut session, &mut submit, &data).unwrap();
        submit.flush(&mut session).unwrap();

        assert_eq!(session.samples.len(), 16);
        assert_eq!(session.samples[0], 0x0001);
        assert_eq!(session.samples[1], 0x0001);
        assert_eq!(session.samples[15], 0x0004);
        assert!(session.samples[2..15].iter().all(|&s| s == 0));
    }

    #[test]
    fn stream_survives_odd_chunk_lengths() {
        let mut session = CollectingSession::default();
        let mut submit = SubmitBuffer::new(2, 0);
        let mut decoder = StreamDecoder::new(0x0001, Duration::from_secs(3600));

        let data = 0x00ffu16.to_le_bytes();
        decoder
            .process(&mut session, &mut submit, &data[..1])
            .unwrap();
        decoder
            .process(&mut session, &mut submit, &data[1..])
            .unwrap();
        submit.flush(&mut session).unwrap();
        assert_eq!(session.samples.len(), 16);
        assert!(session.samples[..8].iter().all(|&s| s == 1));
        assert!(session.samples[8..].iter().all(|&s| s == 0));
    }
}
