//! Kingst LA2016 / LA1016 acquisition engine.
//!
//! An FX2 MCU fronts the FPGA; configuration flows through vendor control
//! requests and capture data through a bulk endpoint. Memory captures are
//! run-length compressed on the device and downloaded after the run stops;
//! streaming captures (explicitly requested) forward raw channel cells
//! while the run is still going. The two analog PWM outputs ride along on
//! the same register file but are independent of acquisition.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::firmware::FirmwareLoader;
use crate::la2016_bringup;
use crate::la2016_decode::{PacketDecoder, StreamDecoder};
use crate::la2016_proto as proto;
use crate::la2016_trigger::{self, TriggerWords};
use crate::session::{Packet, PollStatus, Session, TriggerSpec};
use crate::submit::SubmitBuffer;
use crate::transport::ControlTransport;
use crate::{Error, Result};

/// Model descriptors, as resolved by the framework's EEPROM dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct La2016Model {
    pub name: &'static str,
    pub max_samplerate: u64,
    pub channels: usize,
    pub memory: bool,
    /// On-device capture memory.
    pub memory_bits: u64,
    /// The clock the sampling divider divides down from.
    pub base_clock: u64,
    pub bitstream: &'static str,
}

pub const LA2016: La2016Model = La2016Model {
    name: "LA2016",
    max_samplerate: 200_000_000,
    channels: 16,
    memory: true,
    memory_bits: 1 << 30,
    base_clock: 200_000_000,
    bitstream: "kingst-la2016a1.bitstream",
};

pub const LA1016: La2016Model = La2016Model {
    name: "LA1016",
    max_samplerate: 100_000_000,
    channels: 16,
    memory: true,
    memory_bits: 1 << 30,
    base_clock: 200_000_000,
    bitstream: "kingst-la1016a1.bitstream",
};

/// Hard ceiling on the configurable sample count.
pub const MAX_SAMPLE_DEPTH: u64 = 10_000_000_000;

pub const PWM_CHANNELS: usize = 2;
const PWM_CLOCK: u64 = 200_000_000;
const PWM_FREQ_MAX: f64 = 20_000_000.0;

const THRESHOLD_RANGE: f64 = 4.0;

const DOWNLOAD_CHUNK: usize = 256 * 1024;
const STREAM_CHUNK: usize = 64 * 1024;
/// Consecutive empty bulk reads tolerated before a download is declared
/// stalled.
const DOWNLOAD_EMPTY_READS: usize = 20;

const STREAM_FLUSH_DEFAULT: Duration = Duration::from_millis(200);

/// One analog PWM output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmSetting {
    pub enabled: bool,
    pub frequency: f64,
    /// Duty cycle in percent.
    pub duty: u8,
}

impl Default for PwmSetting {
    fn default() -> Self {
        PwmSetting {
            enabled: false,
            frequency: 1_000.0,
            duty: 50,
        }
    }
}

/// Acquisition run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Capture,
    Stopping,
    Download,
}

struct RunContext {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    triggered_seen: bool,
    stop_requested: bool,
    submit: SubmitBuffer,
    /// Present in streaming mode only.
    stream: Option<StreamDecoder>,
}

pub struct La2016Device<T: ControlTransport> {
    transport: T,
    #[allow(dead_code)]
    loader: Box<dyn FirmwareLoader>,
    model: La2016Model,

    samplerate: u64,
    limit_samples: u64,
    limit_msec: u64,
    capture_ratio: u64,
    channel_mask: u16,
    threshold_volts: f64,
    pwm: [PwmSetting; PWM_CHANNELS],
    streaming: bool,
    stream_flush_interval: Duration,

    trigger_words: TriggerWords,
    state: RunState,
    run: Option<RunContext>,
}

impl<T: ControlTransport> La2016Device<T> {
    /// Take ownership of the transport and bring the FPGA up, reusing an
    /// already configured bitstream when the device allows it.
    pub fn open(mut transport: T, loader: Box<dyn FirmwareLoader>, model: La2016Model) -> Result<Self> {
        la2016_bringup::bringup(&mut transport, loader.as_ref(), model.bitstream)?;
        Ok(La2016Device {
            transport,
            loader,
            model,
            samplerate: model.max_samplerate,
            limit_samples: 0,
            limit_msec: 0,
            capture_ratio: 50,
            channel_mask: 0xffff,
            threshold_volts: 1.58,
            pwm: [PwmSetting::default(); PWM_CHANNELS],
            streaming: false,
            stream_flush_interval: STREAM_FLUSH_DEFAULT,
            trigger_words: TriggerWords::default(),
            state: RunState::Idle,
            run: None,
        })
    }

    pub fn model(&self) -> &La2016Model {
        &self.model
    }

    /// Access the underlying transport, e.g. for framework diagnostics.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// The divider the hardware will run with: the smallest 16-bit integer
    /// not below `base / requested`, clamped to the model's fastest rate.
    fn divider(&self) -> u16 {
        let base = self.model.base_clock;
        let min_divider = (base / self.model.max_samplerate).max(1);
        let wanted = (base + self.samplerate - 1) / self.samplerate;
        wanted.max(min_divider).min(u64::from(u16::MAX)) as u16
    }

    /// The samplerate actually produced for the current configuration.
    pub fn effective_samplerate(&self) -> u64 {
        self.model.base_clock / u64::from(self.divider())
    }

    pub fn set_samplerate(&mut self, samplerate: u64) -> Result<()> {
        self.check_idle()?;
        if samplerate == 0 || samplerate > self.model.max_samplerate {
            return Err(Error::Argument(format!(
                "samplerate {} not supported by {}",
                samplerate, self.model.name
            )));
        }
        self.samplerate = samplerate;
        Ok(())
    }

    pub fn set_limit_samples(&mut self, limit: u64) -> Result<()> {
        self.check_idle()?;
        if limit > MAX_SAMPLE_DEPTH {
            return Err(Error::Argument(format!(
                "sample depth {} exceeds the device maximum",
                limit
            )));
        }
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

    pub fn set_channel_mask(&mut self, mask: u16) -> Result<()> {
        self.check_idle()?;
        if mask == 0 {
            return Err(Error::Argument("no channels enabled".into()));
        }
        self.channel_mask = mask;
        Ok(())
    }

    pub fn set_threshold_voltage(&mut self, volts: f64) -> Result<()> {
        self.check_idle()?;
        if !volts.is_finite() || volts < -THRESHOLD_RANGE || volts > THRESHOLD_RANGE {
            return Err(Error::Argument(format!(
                "threshold {} V outside -{}..{} V",
                volts, THRESHOLD_RANGE, THRESHOLD_RANGE
            )));
        }
        self.threshold_volts = volts;
        Ok(())
    }

    /// Streaming bypasses the on-device compression; it has to be asked for
    /// explicitly.
    pub fn set_streaming(&mut self, streaming: bool) -> Result<()> {
        self.check_idle()?;
        self.streaming = streaming;
        Ok(())
    }

    pub fn set_stream_flush_interval(&mut self, interval: Duration) -> Result<()> {
        self.check_idle()?;
        self.stream_flush_interval = interval;
        Ok(())
    }

    /// Configure one PWM output. Takes effect immediately; the generators
    /// run independently of acquisition.
    pub fn set_pwm(&mut self, index: usize, setting: PwmSetting) -> Result<()> {
        if index >= PWM_CHANNELS {
            return Err(Error::Argument(format!("PWM channel {} out of range", index)));
        }
        if !setting.frequency.is_finite()
            || setting.frequency <= 0.0
            || setting.frequency > PWM_FREQ_MAX
        {
            return Err(Error::Argument(format!(
                "PWM frequency {} Hz out of range",
                setting.frequency
            )));
        }
        if setting.duty > 100 {
            return Err(Error::Argument(format!(
                "PWM duty {}% not in 0..=100",
                setting.duty
            )));
        }
        self.pwm[index] = setting;
        self.apply_pwm(index)?;
        self.apply_pwm_enables()
    }

    pub fn pwm(&self, index: usize) -> Option<&PwmSetting> {
        self.pwm.get(index)
    }

    fn check_idle(&self) -> Result<()> {
        match self.state {
            RunState::Idle => Ok(()),
            _ => Err(Error::Bug("configuration change during acquisition")),
        }
    }

    fn apply_pwm(&mut self, index: usize) -> Result<()> {
        let setting = self.pwm[index];
        let period = (PWM_CLOCK as f64 / setting.frequency) as u32;
        let duty = (u64::from(period) * u64::from(setting.duty) / 100) as u32;
        let mut image = [0u8; 8];
        LittleEndian::write_u32(&mut image[..4], period);
        LittleEndian::write_u32(&mut image[4..], duty);
        let reg = if index == 0 {
            proto::REG_PWM1
        } else {
            proto::REG_PWM2
        };
        proto::write_reg(&mut self.transport, reg, &image)
    }

    fn apply_pwm_enables(&mut self) -> Result<()> {
        let mut enables = 0u8;
        for (i, setting) in self.pwm.iter().enumerate() {
            if setting.enabled {
                enables |= 1 << i;
            }
        }
        proto::write_reg_u8(&mut self.transport, proto::REG_PWM_EN, enables)
    }

    fn write_threshold(&mut self) -> Result<()> {
        // The comparator reference is a filtered PWM; full range maps the
        // supported voltage window onto the duty register.
        let duty = ((self.threshold_volts + THRESHOLD_RANGE) / (2.0 * THRESHOLD_RANGE)
            * f64::from(u16::MAX)) as u16;
        let mut image = [0u8; 2];
        LittleEndian::write_u16(&mut image, duty);
        proto::write_reg(&mut self.transport, proto::REG_THRESHOLD, &image)
    }

    fn write_sampling_config(&mut self) -> Result<()> {
        let limit = self.limit_samples.min(u64::from(u32::MAX)) as u32;
        let pre_trigger_samples = (u64::from(limit) * self.capture_ratio / 100) as u32;
        // Pre-trigger memory is a byte quantity with the low 8 bits shifted
        // out, as the vendor firmware expects it.
        let memory_bytes = self.model.memory_bits / 8;
        let pre_trigger_memory = ((memory_bytes * self.capture_ratio / 100) >> 8) as u32;

        let mut image = [0u8; 16];
        LittleEndian::write_u32(&mut image[0..4], limit);
        image[4] = 0;
        LittleEndian::write_u32(&mut image[5..9], pre_trigger_samples);
        LittleEndian::write_u32(&mut image[9..13], pre_trigger_memory);
        LittleEndian::write_u16(&mut image[13..15], self.divider());
        image[15] = self.channel_mask.count_ones() as u8;
        proto::write_reg(&mut self.transport, proto::REG_SAMPLING, &image)
    }

    /// Configure the hardware and start the run.
    pub fn acquisition_start<S: Session>(
        &mut self,
        spec: &TriggerSpec,
        session: &mut S,
    ) -> Result<()> {
        if self.state != RunState::Idle {
            return Err(Error::Bug("acquisition already running"));
        }
        let words =
            la2016_trigger::convert_trigger(spec, u32::from(self.channel_mask), self.model.channels)?;
        if self.streaming && words.use_trigger() {
            return Err(Error::Unsupported("triggers are not available in streaming mode"));
        }

        match self.arm(&words, session) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = session.send(Packet::End);
                self.run = None;
                self.state = RunState::Idle;
                Err(err)
            }
        }
    }

    fn arm<S: Session>(&mut self, words: &TriggerWords, session: &mut S) -> Result<()> {
        let capt_mode = if self.streaming {
            proto::CAPTMODE_STREAM
        } else {
            proto::CAPTMODE_MEMORY
        };
        proto::write_reg_u8(&mut self.transport, proto::REG_CAPT_MODE, capt_mode)?;
        self.write_sampling_config()?;
        la2016_trigger::write_trigger(&mut self.transport, words)?;
        self.write_threshold()?;
        self.transport.ctrl_out(proto::CMD_BULK_RESET, 0, 0, &[])?;
        proto::write_reg_u8(&mut self.transport, proto::REG_RUN, proto::RUNMODE_RUN)?;

        let effective = self.effective_samplerate();
        session.send(Packet::Header {
            samplerate: effective,
        })?;

        let timeout = self.acquisition_timeout(effective);
        let deadline = if words.use_trigger() {
            None
        } else {
            timeout.map(|t| Instant::now() + t)
        };
        let mut run = RunContext {
            timeout,
            deadline,
            triggered_seen: false,
            stop_requested: false,
            submit: SubmitBuffer::new(2, self.limit_samples),
            stream: None,
        };
        if self.streaming {
            // Streamed data flows while the run is going; open the frame now
            // and start the bulk pipe.
            self.transport.ctrl_out(proto::CMD_BULK_START, 0, 0, &[])?;
            session.send(Packet::FrameBegin)?;
            run.stream = Some(StreamDecoder::new(
                self.channel_mask,
                self.stream_flush_interval,
            ));
        }
        self.trigger_words = *words;
        self.run = Some(run);
        self.state = RunState::Capture;
        debug!(
            "armed: {} Hz effective, {} mode, triggers {}",
            effective,
            if self.streaming { "streaming" } else { "memory" },
            if words.use_trigger() { "on" } else { "off" }
        );
        Ok(())
    }

    fn acquisition_timeout(&self, samplerate: u64) -> Option<Duration> {
        let mut limit_ms: Option<u64> = None;
        if self.limit_samples > 0 {
            limit_ms = Some(self.limit_samples.saturating_mul(1000) / samplerate);
        }
        if self.limit_msec > 0 {
            limit_ms = Some(match limit_ms {
                Some(ms) => ms.min(self.limit_msec),
                None => self.limit_msec,
            });
        }
        let slack_ms = 2 * 65_536 * 1000 / samplerate;
        limit_ms.map(|ms| Duration::from_millis(ms + slack_ms))
    }

    /// The framework's periodic callback.
    pub fn poll<S: Session>(&mut self, session: &mut S) -> Result<PollStatus> {
        match self.state {
            RunState::Idle => Ok(PollStatus::Idle),
            RunState::Capture => {
                if self.run.as_ref().map_or(false, |run| run.stream.is_some()) {
                    self.poll_streaming(session)
                } else {
                    self.poll_capture(session)
                }
            }
            RunState::Stopping | RunState::Download => {
                self.halt()?;
                self.finish_memory_capture(session)
            }
        }
    }

    fn poll_capture<S: Session>(&mut self, session: &mut S) -> Result<PollStatus> {
        let now = Instant::now();

        if self.run.as_ref().map_or(false, |run| run.stop_requested) {
            self.state = RunState::Stopping;
            return Ok(PollStatus::Active);
        }

        let status = match proto::run_status(&mut self.transport) {
            Ok(status) => status,
            Err(err) => {
                warn!("status read failed during capture: {}", err);
                self.state = RunState::Stopping;
                return Ok(PollStatus::Active);
            }
        };
        if !status.signature_ok() {
            warn!("implausible run state {:#06x} during capture", status.bits());
        }

        let run = self.run.as_mut().ok_or(Error::Bug("capture without run state"))?;
        if status.contains(proto::RunStatus::TRIGGERED) && !run.triggered_seen {
            debug!("hardware trigger fired");
            run.triggered_seen = true;
            if let Some(timeout) = run.timeout {
                run.deadline = Some(now + timeout);
            }
        }

        let deadline_hit = run.deadline.map_or(false, |deadline| now >= deadline);
        if status.contains(proto::RunStatus::DONE) || deadline_hit {
            self.halt()?;
            return self.finish_memory_capture(session);
        }
        Ok(PollStatus::Active)
    }

    fn poll_streaming<S: Session>(&mut self, session: &mut S) -> Result<PollStatus> {
        let now = Instant::now();
        let stop = self.run.as_ref().map_or(false, |run| run.stop_requested);
        let deadline_hit = self
            .run
            .as_ref()
            .and_then(|run| run.deadline)
            .map_or(false, |deadline| now >= deadline);

        let mut buf = vec![0u8; STREAM_CHUNK];
        let n = self.transport.read(&mut buf)?;
        if n > 0 {
            let run = self.run.as_mut().ok_or(Error::Bug("capture without run state"))?;
            let stream = run.stream.as_mut().ok_or(Error::Bug("stream decoder missing"))?;
            stream.process(session, &mut run.submit, &buf[..n])?;
        }

        let limit_hit = self
            .run
            .as_ref()
            .map_or(false, |run| run.submit.limit_reached());
        if stop || deadline_hit || limit_hit {
            return self.finish_streaming_capture(session);
        }
        Ok(PollStatus::Active)
    }

    fn halt(&mut self) -> Result<()> {
        proto::write_reg_u8(&mut self.transport, proto::REG_RUN, proto::RUNMODE_HALT)
    }

    /// Read back the capture bookkeeping and pull the whole run-length
    /// stream through the decoder.
    fn finish_memory_capture<S: Session>(&mut self, session: &mut S) -> Result<PollStatus> {
        self.state = RunState::Download;
        let mut run = self.run.take().ok_or(Error::Bug("download without run state"))?;
        let use_trigger = self.trigger_words.use_trigger() && run.triggered_seen;

        session.send(Packet::FrameBegin)?;
        let result = self.download_memory(session, &mut run, use_trigger);
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

    fn download_memory<S: Session>(
        &mut self,
        session: &mut S,
        run: &mut RunContext,
        use_trigger: bool,
    ) -> Result<()> {
        let info = proto::read_capture_info(&mut self.transport)?;
        let n_pairs = u64::from(info.n_rep_packets.get());
        if n_pairs % proto::RLE_PAIRS_PER_PACKET as u64 != 0 {
            warn!(
                "device reports {} run-length pairs, not a whole packet count",
                n_pairs
            );
        }
        let n_packets = n_pairs / proto::RLE_PAIRS_PER_PACKET as u64;
        let n_bytes = n_packets * proto::TRANSFER_PACKET_BYTES as u64;
        let read_pos = info.write_pos.get().wrapping_sub(n_bytes as u32);
        debug!(
            "downloading {} packets ({} bytes) from position {:#010x}",
            n_packets, n_bytes, read_pos
        );

        let mut window = [0u8; 8];
        LittleEndian::write_u32(&mut window[..4], read_pos);
        LittleEndian::write_u32(&mut window[4..], n_bytes as u32);
        proto::write_reg(&mut self.transport, proto::REG_BULK, &window)?;
        self.transport.ctrl_out(proto::CMD_BULK_START, 0, 0, &[])?;

        let trigger_pairs = if use_trigger {
            Some(u64::from(info.n_rep_packets_before_trigger.get()))
        } else {
            None
        };
        let mut decoder = PacketDecoder::new(trigger_pairs);
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        let mut remaining = n_bytes as usize;
        let mut empty_reads = 0;
        while remaining > 0 {
            let want = buf.len().min(remaining);
            let n = self.transport.read(&mut buf[..want])?;
            if n == 0 {
                // Timeouts on the bulk pipe are routine; only a long run of
                // them is fatal.
                empty_reads += 1;
                if empty_reads > DOWNLOAD_EMPTY_READS {
                    return Err(Error::Timeout("capture download stalled"));
                }
                continue;
            }
            empty_reads = 0;
            decoder.process(session, &mut run.submit, &buf[..n])?;
            remaining -= n;
        }
        run.submit.flush(session)
    }

    fn finish_streaming_capture<S: Session>(&mut self, session: &mut S) -> Result<PollStatus> {
        self.state = RunState::Download;
        self.halt()?;
        let mut run = self.run.take().ok_or(Error::Bug("download without run state"))?;

        // Drain whatever the device still has buffered.
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = self.transport.read(&mut buf)?;
            if n == 0 || run.submit.limit_reached() {
                break;
            }
            let stream = run.stream.as_mut().ok_or(Error::Bug("stream decoder missing"))?;
            stream.process(session, &mut run.submit, &buf[..n])?;
        }

        let flush = run.submit.flush(session);
        let frame_end = session.send(Packet::FrameEnd);
        let end = session.send(Packet::End);
        self.state = RunState::Idle;
        flush?;
        frame_end?;
        end?;
        debug!("streaming capture complete, {} samples delivered", run.submit.accepted());
        Ok(PollStatus::Complete)
    }

    /// Framework stop request; honored on the next poll tick.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.as_mut() {
            run.stop_requested = true;
        }
    }

    /// Outright abort: drop the run without delivering anything further.
    pub fn abort(&mut self) {
        self.run = None;
        self.state = RunState::Idle;
    }
}
