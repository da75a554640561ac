//! The contract with the host framework.
//!
//! The framework owns device discovery, option parsing and the event loop.
//! The acquisition engines receive trigger intent as a [`TriggerSpec`], get
//! ticked through their `poll` methods at roughly [`POLL_INTERVAL`], and
//! deliver everything they produce through the [`Session`] trait.

use std::time::Duration;

use crate::Result;

/// How often the framework is expected to invoke a device's poll callback
/// while an acquisition is running.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One datafeed packet, sent from a device to the framework session.
///
/// A normal acquisition produces `Header`, then for each download a
/// `FrameBegin` .. `FrameEnd` bracket with `Logic` payloads (and at most one
/// `Trigger`) in between, then exactly one `End`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Start of an acquisition. Carries the effective samplerate so the
    /// session can annotate the stream.
    Header { samplerate: u64 },
    /// Opens a capture frame.
    FrameBegin,
    /// A run of decoded samples. `unit_size` is the number of bytes per
    /// sample unit (2 for up to 16 channels, 4 beyond that); `data` holds
    /// `data.len() / unit_size` consecutive sample units, little-endian.
    Logic { unit_size: usize, data: &'a [u8] },
    /// The exact trigger position. Sent between the last pre-trigger and the
    /// first post-trigger sample.
    Trigger,
    /// Closes a capture frame.
    FrameEnd,
    /// End of the acquisition. Always the final packet, even on errors.
    End,
}

/// The framework's session feed.
pub trait Session {
    fn send(&mut self, packet: Packet<'_>) -> Result<()>;
}

/// What a single channel must do for a trigger stage to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMatch {
    Low,
    High,
    Rising,
    Falling,
}

/// One channel's condition within a trigger stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMatch {
    pub channel: usize,
    pub kind: TriggerMatch,
}

/// The framework's trigger description: an ordered list of stages, each a
/// conjunction of channel matches. Both engines accept at most one
/// non-empty stage.
#[derive(Debug, Clone, Default)]
pub struct TriggerSpec {
    pub stages: Vec<Vec<ChannelMatch>>,
}

impl TriggerSpec {
    /// A spec that never fires; acquisitions run untriggered.
    pub fn none() -> Self {
        TriggerSpec::default()
    }

    /// Convenience constructor for the common single-stage case.
    pub fn single_stage(matches: Vec<ChannelMatch>) -> Self {
        TriggerSpec {
            stages: vec![matches],
        }
    }
}

/// What a poll tick accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// No acquisition is running.
    Idle,
    /// The acquisition is still in progress; keep polling.
    Active,
    /// The acquisition finished this tick; the callback can be released.
    Complete,
}
