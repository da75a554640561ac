//! ASIX SIGMA / SIGMA2 acquisition engine.
//!
//! The device is an FPGA behind an FTDI FIFO bridge with 256 Mbit of sample
//! SDRAM. Everything here runs on the framework's event-loop thread: the
//! configuration setters reprogram the device between acquisitions, and the
//! periodic poll callback drives the capture state machine until the sample
//! memory has been downloaded and delivered.

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::firmware::FirmwareLoader;
use crate::session::{Packet, PollStatus, Session, TriggerSpec};
use crate::sigma_bringup;
use crate::sigma_decode;
use crate::sigma_proto as proto;
use crate::sigma_trigger::{self, TriggerMasks};
use crate::submit::SubmitBuffer;
use crate::transport::BitbangBridge;
use crate::{Error, Result};

/// The base clock all divided samplerates derive from.
pub const CLOCK_BASE: u64 = 50_000_000;

/// Samplerates the hardware can produce.
pub const SAMPLERATES: [u64; 10] = [
    200_000,
    250_000,
    500_000,
    1_000_000,
    5_000_000,
    10_000_000,
    25_000_000,
    50_000_000,
    100_000_000,
    200_000_000,
];

/// Fixed capabilities of the family, as the framework's model dispatch
/// reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigmaModel {
    pub name: &'static str,
    pub max_samplerate: u64,
    pub channels: usize,
    pub memory: bool,
    pub base_clock: u64,
}

pub const SIGMA: SigmaModel = SigmaModel {
    name: "SIGMA",
    max_samplerate: 200_000_000,
    channels: 16,
    memory: true,
    base_clock: CLOCK_BASE,
};

/// The FPGA netlist variants, each its own firmware resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareKind {
    /// 16 channels, base clock divided down from 50 MHz.
    Mhz50,
    /// 8 channels at 100 MHz.
    Mhz100,
    /// 4 channels at 200 MHz.
    Mhz200,
    /// 16 channels clocked from the external input.
    Sync50,
    /// Frequency-counter netlist; not an acquisition mode.
    Phasor,
}

impl FirmwareKind {
    pub fn resource(self) -> &'static str {
        match self {
            FirmwareKind::Mhz50 => "asix-sigma-50.fw",
            FirmwareKind::Mhz100 => "asix-sigma-100.fw",
            FirmwareKind::Mhz200 => "asix-sigma-200.fw",
            FirmwareKind::Sync50 => "asix-sigma-50sync.fw",
            FirmwareKind::Phasor => "asix-sigma-phasor.fw",
        }
    }

    /// Channels actually sampled under this netlist.
    pub fn channel_count(self) -> usize {
        match self {
            FirmwareKind::Mhz100 => 8,
            FirmwareKind::Mhz200 => 4,
            _ => 16,
        }
    }

    fn for_samplerate(samplerate: u64, external_clock: bool) -> Result<FirmwareKind> {
        if external_clock {
            return Ok(FirmwareKind::Sync50);
        }
        match samplerate {
            100_000_000 => Ok(FirmwareKind::Mhz100),
            200_000_000 => Ok(FirmwareKind::Mhz200),
            rate if rate > 0 && rate <= CLOCK_BASE && CLOCK_BASE % rate == 0 => {
                Ok(FirmwareKind::Mhz50)
            }
            rate => Err(Error::Argument(format!("unsupported samplerate {}", rate))),
        }
    }
}

/// Which input clock edge latches samples under the external-clock netlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEdge {
    Rising,
    Falling,
}

/// Acquisition run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No netlist configured yet.
    Uninitialized,
    Idle,
    Capture,
    Stopping,
    Download,
}

/// State scoped to one acquisition, allocated at start and freed on every
/// exit path.
struct RunContext {
    timeout: Option<Duration>,
    /// Armed once the timeout clock starts; with triggers in use that is
    /// only after the hardware reports triggered.
    deadline: Option<Instant>,
    triggered_seen: bool,
    stop_requested: bool,
    submit: SubmitBuffer,
}

const FORCE_STOP_POLLS: usize = 100;

pub struct SigmaDevice<B: BitbangBridge> {
    bridge: B,
    loader: Box<dyn FirmwareLoader>,
    model: SigmaModel,

    samplerate: u64,
    limit_samples: u64,
    limit_msec: u64,
    capture_ratio: u64,
    channel_mask: u16,
    external_clock: bool,
    clock_edge: ClockEdge,

    /// Netlist currently on the FPGA, so unchanged samplerates skip the
    /// upload.
    firmware: Option<FirmwareKind>,
    num_channels: usize,
    samples_per_event: usize,

    trigger_masks: TriggerMasks,
    state: RunState,
    run: Option<RunContext>,
}

impl<B: BitbangBridge> SigmaDevice<B> {
    /// Take ownership of the bridge. No hardware traffic happens until the
    /// first configuration or acquisition start.
    pub fn open(bridge: B, loader: Box<dyn FirmwareLoader>) -> Self {
        SigmaDevice {
            bridge,
            loader,
            model: SIGMA,
            samplerate: 200_000,
            limit_samples: 0,
            limit_msec: 0,
            capture_ratio: 50,
            channel_mask: 0xffff,
            external_clock: false,
            clock_edge: ClockEdge::Rising,
            firmware: None,
            num_channels: 16,
            samples_per_event: 1,
            trigger_masks: TriggerMasks::default(),
            state: RunState::Uninitialized,
            run: None,
        }
    }

    pub fn model(&self) -> &SigmaModel {
        &self.model
    }

    /// Access the underlying bridge, e.g. for framework diagnostics.
    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn samplerate(&self) -> u64 {
        self.samplerate
    }

    pub fn channel_count(&self) -> usize {
        self.num_channels
    }

    pub fn samples_per_event(&self) -> usize {
        self.samples_per_event
    }

    /// Change the samplerate, uploading a different netlist if the new rate
    /// needs one.
    pub fn set_samplerate(&mut self, samplerate: u64) -> Result<()> {
        self.check_idle()?;
        if !SAMPLERATES.contains(&samplerate) {
            return Err(Error::Argument(format!(
                "samplerate {} not supported",
                samplerate
            )));
        }
        let previous = self.samplerate;
        self.samplerate = samplerate;
        if let Err(err) = self.ensure_firmware() {
            self.samplerate = previous;
            return Err(err);
        }
        if self.state == RunState::Uninitialized {
            self.state = RunState::Idle;
        }
        Ok(())
    }

    pub fn set_limit_samples(&mut self, limit: u64) -> Result<()> {
        self.check_idle()?;
        self.limit_samples = limit;
        Ok(())
    }

    pub fn set_limit_msec(&mut self, limit: u64) -> Result<()> {
        self.check_idle()?;
        self.limit_msec = limit;
        Ok(())
    }

    pub fn set_capture_ratio(&mut self, ratio: u64) -> Result<()> {
        self.check_idle()?;
        if ratio > 100 {
            return Err(Error::Argument(format!("capture ratio {} not in 0..=100", ratio)));
        }
        self.capture_ratio = ratio;
        Ok(())
    }

    /// Enabled-channel bitmask. Channels beyond the current mode's effective
    /// count are masked off at acquisition start.
    pub fn set_channel_mask(&mut self, mask: u16) -> Result<()> {
        self.check_idle()?;
        if mask == 0 {
            return Err(Error::Argument("no channels enabled".into()));
        }
        self.channel_mask = mask;
        Ok(())
    }

    pub fn set_external_clock(&mut self, external: bool) -> Result<()> {
        self.check_idle()?;
        self.external_clock = external;
        Ok(())
    }

    pub fn set_clock_edge(&mut self, edge: ClockEdge) -> Result<()> {
        self.check_idle()?;
        self.clock_edge = edge;
        Ok(())
    }

    fn check_idle(&self) -> Result<()> {
        match self.state {
            RunState::Uninitialized | RunState::Idle => Ok(()),
            _ => Err(Error::Bug("configuration change during acquisition")),
        }
    }

    fn ensure_firmware(&mut self) -> Result<()> {
        let kind = FirmwareKind::for_samplerate(self.samplerate, self.external_clock)?;
        if self.firmware != Some(kind) {
            sigma_bringup::upload_firmware(&mut self.bridge, self.loader.as_ref(), kind.resource())?;
            self.firmware = Some(kind);
        } else {
            debug!("netlist {:?} already configured", kind);
        }
        self.num_channels = kind.channel_count();
        self.samples_per_event = 16 / self.num_channels;
        Ok(())
    }

    /// Channels that are both user-enabled and sampled in the current mode.
    fn effective_channel_mask(&self) -> u16 {
        let mode_mask = match self.num_channels {
            16 => 0xffff,
            8 => 0x00ff,
            _ => 0x000f,
        };
        self.channel_mask & mode_mask
    }

    fn write_clock_select(&mut self) -> Result<()> {
        let disabled = !self.effective_channel_mask();
        let divider = if self.external_clock || self.samplerate > CLOCK_BASE {
            0
        } else {
            (CLOCK_BASE / self.samplerate - 1) as u8
        };
        // Async byte: bit 0 selects the external clock input, bit 1 samples
        // on its falling edge.
        let mut async_clock = 0u8;
        if self.external_clock {
            async_clock |= 0x01;
            if self.clock_edge == ClockEdge::Falling {
                async_clock |= 0x02;
            }
        }
        let mut image = [0u8; 4];
        image[0] = async_clock;
        image[1] = divider;
        LittleEndian::write_u16(&mut image[2..4], disabled);
        proto::write_register(&mut self.bridge, proto::WREG_CLOCK_SELECT, &image)
    }

    fn acquisition_timeout(&self) -> Option<Duration> {
        let mut limit_ms: Option<u64> = None;
        if self.limit_samples > 0 {
            limit_ms = Some(self.limit_samples.saturating_mul(1000) / self.samplerate);
        }
        if self.limit_msec > 0 {
            limit_ms = Some(match limit_ms {
                Some(ms) => ms.min(self.limit_msec),
                None => self.limit_msec,
            });
        }
        // Worst case the RLE pipeline holds back two full timestamp rollovers
        // before forcing a cluster out.
        let slack_ms = 2 * 65_536 * 1000 / self.samplerate;
        limit_ms.map(|ms| Duration::from_millis(ms + slack_ms))
    }

    /// Configure the hardware and arm the capture. On error nothing has
    /// been armed and no datafeed packet has been sent except that a failure
    /// after the header still produces the closing `End`.
    pub fn acquisition_start<S: Session>(
        &mut self,
        spec: &TriggerSpec,
        session: &mut S,
    ) -> Result<()> {
        match self.state {
            RunState::Uninitialized | RunState::Idle => {}
            _ => return Err(Error::Bug("acquisition already running")),
        }

        let fast_mode = self.samplerate > CLOCK_BASE && !self.external_clock;
        let masks = sigma_trigger::convert_trigger(spec, self.effective_channel_mask(), fast_mode)?;
        if fast_mode && masks.enabled {
            // Validate the pin before any hardware write.
            sigma_trigger::fast_trigger_value(&masks, self.num_channels)?;
        }

        self.ensure_firmware()?;
        self.state = RunState::Idle;

        match self.arm(&masks, session) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Fatal start: close the feed without any logic payload.
                let _ = session.send(Packet::End);
                self.run = None;
                self.state = RunState::Idle;
                Err(err)
            }
        }
    }

    fn arm<S: Session>(&mut self, masks: &TriggerMasks, session: &mut S) -> Result<()> {
        self.write_clock_select()?;

        if masks.enabled {
            if self.samples_per_event > 1 {
                let value = sigma_trigger::fast_trigger_value(masks, self.num_channels)?;
                proto::set_register(&mut self.bridge, proto::WREG_TRIGGER_SELECT2, value)?;
            } else {
                let lut = sigma_trigger::build_basic_lut(masks);
                sigma_trigger::write_lut(&mut self.bridge, &lut)?;
            }
        }

        // Route the trigger to the OUT pin; never trigger from the IN pin.
        proto::set_register(
            &mut self.bridge,
            proto::WREG_TRIGGER_OPTION,
            proto::TRGOPT_TRGOEN,
        )?;

        let post_trigger = (self.capture_ratio * 255 / 100) as u8;
        proto::set_register(&mut self.bridge, proto::WREG_POST_TRIGGER, post_trigger)?;

        let mut mode = proto::WriteMode::TRIGGER_RESET | proto::WriteMode::SDRAM_WRITE_EN;
        if masks.enabled {
            mode |= proto::WriteMode::TRIGGER_EN;
        }
        proto::set_register(&mut self.bridge, proto::WREG_MODE, mode.bits())?;

        session.send(Packet::Header {
            samplerate: self.samplerate,
        })?;

        let timeout = self.acquisition_timeout();
        let deadline = if masks.enabled {
            // The clock starts once the hardware reports triggered.
            None
        } else {
            timeout.map(|t| Instant::now() + t)
        };
        self.trigger_masks = *masks;
        self.run = Some(RunContext {
            timeout,
            deadline,
            triggered_seen: false,
            stop_requested: false,
            submit: SubmitBuffer::new(2, self.limit_samples),
        });
        self.state = RunState::Capture;
        debug!(
            "armed: {} Hz, {} channels, triggers {}",
            self.samplerate,
            self.num_channels,
            if masks.enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// The framework's periodic callback.
    pub fn poll<S: Session>(&mut self, session: &mut S) -> Result<PollStatus> {
        match self.state {
            RunState::Uninitialized | RunState::Idle => Ok(PollStatus::Idle),
            RunState::Capture => self.poll_capture(session),
            RunState::Stopping | RunState::Download => {
                self.force_stop()?;
                self.finish_capture(session)
            }
        }
    }

    fn poll_capture<S: Session>(&mut self, session: &mut S) -> Result<PollStatus> {
        let now = Instant::now();

        if self.run.as_ref().map_or(false, |run| run.stop_requested) {
            self.state = RunState::Stopping;
            return Ok(PollStatus::Active);
        }

        if self.trigger_masks.enabled {
            let mode = match proto::read_mode(&mut self.bridge) {
                Ok(mode) => mode,
                Err(err) => {
                    // Deliver what the device captured so far.
                    warn!("status read failed during capture: {}", err);
                    self.state = RunState::Stopping;
                    return Ok(PollStatus::Active);
                }
            };
            let run = self.run.as_mut().ok_or(Error::Bug("capture without run state"))?;
            if mode.contains(proto::ReadMode::TRIGGERED) && !run.triggered_seen {
                debug!("hardware trigger fired");
                run.triggered_seen = true;
                if let Some(timeout) = run.timeout {
                    run.deadline = Some(now + timeout);
                }
            }
            if !run.triggered_seen && mode.contains(proto::ReadMode::ROUND) {
                // The ring filled without a trigger; drain it instead of
                // waiting forever.
                warn!("sample memory wrapped before the trigger fired");
                self.state = RunState::Stopping;
                return Ok(PollStatus::Active);
            }
        }

        let deadline_hit = self
            .run
            .as_ref()
            .and_then(|run| run.deadline)
            .map_or(false, |deadline| now >= deadline);
        if deadline_hit {
            self.force_stop()?;
            return self.finish_capture(session);
        }
        Ok(PollStatus::Active)
    }

    fn force_stop(&mut self) -> Result<()> {
        proto::set_register(
            &mut self.bridge,
            proto::WREG_MODE,
            (proto::WriteMode::FORCE_STOP | proto::WriteMode::SDRAM_WRITE_EN).bits(),
        )?;
        let mut delay = Duration::from_micros(100);
        for _ in 0..FORCE_STOP_POLLS {
            if proto::read_mode(&mut self.bridge)?.contains(proto::ReadMode::POST_TRIGGERED) {
                return Ok(());
            }
            thread::sleep(delay);
            delay = (delay * 2).min(Duration::from_millis(10));
        }
        warn!("post-trigger flush not confirmed, downloading anyway");
        Ok(())
    }

    /// Download and deliver sample memory, then return to idle. The frame
    /// bracket and the final `End` go out on every path, including errors.
    fn finish_capture<S: Session>(&mut self, session: &mut S) -> Result<PollStatus> {
        self.state = RunState::Download;
        let mut run = self.run.take().ok_or(Error::Bug("download without run state"))?;

        session.send(Packet::FrameBegin)?;
        let result = sigma_decode::download(
            &mut self.bridge,
            session,
            &mut run.submit,
            self.samples_per_event,
            &self.trigger_masks,
        );
        if result.is_err() {
            let _ = run.submit.flush(session);
        }
        let frame_end = session.send(Packet::FrameEnd);
        let end = session.send(Packet::End);
        self.state = RunState::Idle;

        result?;
        frame_end?;
        end?;
        debug!("acquisition complete, {} samples delivered", run.submit.accepted());
        Ok(PollStatus::Complete)
    }

    /// Framework stop request; honored on the next poll tick so capture
    /// memory still drains to the session.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.as_mut() {
            run.stop_requested = true;
        }
    }

    /// Outright abort: drop the run without delivering anything further.
    pub fn abort(&mut self) {
        self.run = None;
        self.state = if self.firmware.is_some() {
            RunState::Idle
        } else {
            RunState::Uninitialized
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_selection_follows_the_samplerate() {
        assert_eq!(
            FirmwareKind::for_samplerate(1_000_000, false).unwrap(),
            FirmwareKind::Mhz50
        );
        assert_eq!(
            FirmwareKind::for_samplerate(100_000_000, false).unwrap(),
            FirmwareKind::Mhz100
        );
        assert_eq!(
            FirmwareKind::for_samplerate(200_000_000, false).unwrap(),
            FirmwareKind::Mhz200
        );
        assert_eq!(
            FirmwareKind::for_samplerate(1_000_000, true).unwrap(),
            FirmwareKind::Sync50
        );
        assert!(FirmwareKind::for_samplerate(3_000_000, false).is_err());
    }

    #[test]
    fn channel_geometry_matches_the_netlist() {
        for &(kind, channels) in &[
            (FirmwareKind::Mhz50, 16),
            (FirmwareKind::Mhz100, 8),
            (FirmwareKind::Mhz200, 4),
            (FirmwareKind::Sync50, 16),
        ] {
            assert_eq!(kind.channel_count(), channels);
            assert_eq!((16 / channels) * channels, 16);
        }
    }
}
