//! Shared test fixtures: an in-memory firmware loader, session recorders,
//! and protocol-level simulators for both device families.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use lacore::firmware::FirmwareLoader;
use lacore::la2016_proto;
use lacore::session::{Packet, Session};
use lacore::sigma_proto;
use lacore::{BitbangBridge, ControlTransport, Error, Result, Transport};

/// Route driver logging into the test harness output.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct MapLoader(pub HashMap<String, Vec<u8>>);

impl MapLoader {
    pub fn new() -> Self {
        MapLoader(HashMap::new())
    }

    pub fn with(mut self, name: &str, data: Vec<u8>) -> Self {
        self.0.insert(name.to_string(), data);
        self
    }

    /// All five SIGMA netlist variants, 64 bytes each.
    pub fn sigma_defaults() -> Self {
        let mut loader = MapLoader::new();
        for name in &[
            "asix-sigma-50.fw",
            "asix-sigma-100.fw",
            "asix-sigma-200.fw",
            "asix-sigma-50sync.fw",
            "asix-sigma-phasor.fw",
        ] {
            loader.0.insert(name.to_string(), vec![0x5a; 64]);
        }
        loader
    }
}

impl FirmwareLoader for MapLoader {
    fn load(&self, name: &str) -> Result<Vec<u8>> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Resource(format!("no resource {}", name)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Header,
    FrameBegin,
    Logic,
    Trigger,
    FrameEnd,
    End,
}

/// Records every packet and keeps the full decoded sample stream.
#[derive(Default)]
pub struct RecordingSession {
    pub kinds: Vec<Kind>,
    pub samples: Vec<u16>,
    pub trigger_at: Option<usize>,
    pub header_samplerate: Option<u64>,
}

impl RecordingSession {
    pub fn count(&self, kind: Kind) -> usize {
        self.kinds.iter().filter(|&&k| k == kind).count()
    }
}

impl Session for RecordingSession {
    fn send(&mut self, packet: Packet<'_>) -> Result<()> {
        match packet {
            Packet::Header { samplerate } => {
                self.header_samplerate = Some(samplerate);
                self.kinds.push(Kind::Header);
            }
            Packet::FrameBegin => self.kinds.push(Kind::FrameBegin),
            Packet::Logic { unit_size, data } => {
                assert_eq!(unit_size, 2);
                assert_eq!(data.len() % unit_size, 0);
                for pair in data.chunks_exact(2) {
                    self.samples.push(u16::from_le_bytes([pair[0], pair[1]]));
                }
                self.kinds.push(Kind::Logic);
            }
            Packet::Trigger => {
                self.trigger_at = Some(self.samples.len());
                self.kinds.push(Kind::Trigger);
            }
            Packet::FrameEnd => self.kinds.push(Kind::FrameEnd),
            Packet::End => self.kinds.push(Kind::End),
        }
        Ok(())
    }
}

/// Keeps aggregates only; for captures too large to hold sample-by-sample.
#[derive(Default)]
pub struct StatsSession {
    pub kinds: Vec<Kind>,
    pub sample_count: u64,
    pub first: Option<u16>,
    pub last: Option<u16>,
    pub per_value: HashMap<u16, u64>,
}

impl Session for StatsSession {
    fn send(&mut self, packet: Packet<'_>) -> Result<()> {
        match packet {
            Packet::Logic { data, .. } => {
                for pair in data.chunks_exact(2) {
                    let sample = u16::from_le_bytes([pair[0], pair[1]]);
                    if self.first.is_none() {
                        self.first = Some(sample);
                    }
                    self.last = Some(sample);
                    self.sample_count += 1;
                    *self.per_value.entry(sample).or_insert(0) += 1;
                }
                self.kinds.push(Kind::Logic);
            }
            Packet::Header { .. } => self.kinds.push(Kind::Header),
            Packet::FrameBegin => self.kinds.push(Kind::FrameBegin),
            Packet::Trigger => self.kinds.push(Kind::Trigger),
            Packet::FrameEnd => self.kinds.push(Kind::FrameEnd),
            Packet::End => self.kinds.push(Kind::End),
        }
        Ok(())
    }
}

/// Protocol-level simulator of the SIGMA FPGA behind its FTDI bridge.
///
/// In bitbang mode it logs the raw byte stream and answers INIT_B polls; in
/// FIFO mode it parses the nibble command protocol, keeps a register file,
/// and serves DRAM row reads from a sparse row map.
pub struct SigmaSim {
    bitbang: bool,
    bitbang_log: Vec<u8>,
    /// Byte counts of completed bitbang uploads.
    pub uploads: Vec<usize>,

    addr: u8,
    data_low: u8,
    span: Vec<u8>,
    dram_context: bool,

    /// Every byte written, per write-side register.
    pub reg_writes: HashMap<u8, Vec<u8>>,
    /// Every value written to the mode register, in order.
    pub mode_writes: Vec<u8>,
    scratch: u8,
    /// Mode register, read side.
    pub status: u8,
    pub trigger_pos: u32,
    pub stop_pos: u32,
    /// Serve a broken ID byte to fail the handshake.
    pub break_handshake: bool,

    pub dram: HashMap<u16, Vec<u8>>,
    memrow: u16,
    fetch_count: u16,
    bram: VecDeque<Vec<u8>>,
    read_queue: VecDeque<u8>,
}

impl SigmaSim {
    pub fn new() -> Self {
        SigmaSim {
            bitbang: false,
            bitbang_log: Vec::new(),
            uploads: Vec::new(),
            addr: 0,
            data_low: 0,
            span: Vec::new(),
            dram_context: false,
            reg_writes: HashMap::new(),
            mode_writes: Vec::new(),
            scratch: 0,
            status: 0,
            trigger_pos: 0,
            stop_pos: 0,
            break_handshake: false,
            dram: HashMap::new(),
            memrow: 0,
            fetch_count: 0,
            bram: VecDeque::new(),
            read_queue: VecDeque::new(),
        }
    }

    fn process_fifo_byte(&mut self, byte: u8) {
        match byte & 0xf0 {
            sigma_proto::CMD_ADDR_LOW => {
                self.addr = byte & 0x0f;
                self.span.clear();
                self.dram_context = false;
            }
            sigma_proto::CMD_ADDR_HIGH => {
                self.addr = (self.addr & 0x0f) | ((byte & 0x0f) << 4);
            }
            sigma_proto::CMD_DATA_LOW => {
                self.data_low = byte & 0x0f;
            }
            sigma_proto::CMD_DATA_HIGH_WRITE => {
                let value = self.data_low | ((byte & 0x0f) << 4);
                self.write_byte(value);
            }
            sigma_proto::CMD_READ_ADDR => {
                self.serve_read(false);
            }
            sigma_proto::CMD_DRAM_WAIT_ACK => {
                // The same code point is the incrementing register read;
                // only DRAM bursts use it as an ack.
                if !self.dram_context {
                    self.serve_read(true);
                }
            }
            sigma_proto::CMD_DRAM_BLOCK => {
                self.dram_fetch();
                self.dram_context = true;
            }
            sigma_proto::CMD_DRAM_BLOCK_BEGIN => {
                self.dram_context = true;
            }
            sigma_proto::CMD_DRAM_BLOCK_DATA => {
                self.dram_data();
                self.dram_context = true;
            }
            _ => {}
        }
    }

    fn write_byte(&mut self, value: u8) {
        self.span.push(value);
        self.reg_writes.entry(self.addr).or_default().push(value);
        match self.addr {
            sigma_proto::WREG_MODE => {
                self.mode_writes.push(value);
                if value & 0x10 != 0 {
                    // Force-stop completes instantly.
                    self.status |= 0x40;
                }
            }
            sigma_proto::WREG_MEMROW => {
                if self.span.len() == 2 {
                    self.memrow = u16::from_le_bytes([self.span[0], self.span[1]]);
                    self.fetch_count = 0;
                }
            }
            sigma_proto::WREG_TEST => self.scratch = value,
            _ => {}
        }
    }

    fn serve_read(&mut self, increment: bool) {
        let value = match self.addr {
            sigma_proto::RREG_ID => {
                if self.break_handshake {
                    0x00
                } else {
                    sigma_proto::SIGMA_ID
                }
            }
            a @ 1..=3 => (self.trigger_pos >> (8 * (a - 1))) as u8,
            a @ 4..=6 => (self.stop_pos >> (8 * (a - 4))) as u8,
            sigma_proto::RREG_MODE => self.status,
            15 => self.scratch,
            _ => 0,
        };
        self.read_queue.push_back(value);
        if increment {
            self.addr = (self.addr + 1) & 0x0f;
        }
    }

    fn row_data(&self, row: u16) -> Vec<u8> {
        self.dram
            .get(&row)
            .cloned()
            .unwrap_or_else(|| vec![0u8; sigma_proto::ROW_LENGTH_BYTES])
    }

    fn dram_fetch(&mut self) {
        let row = self.memrow.wrapping_add(self.fetch_count);
        self.fetch_count += 1;
        let data = self.row_data(row);
        self.bram.push_back(data);
    }

    fn dram_data(&mut self) {
        if let Some(data) = self.bram.pop_front() {
            self.read_queue.extend(data);
        }
    }
}

impl Transport for SigmaSim {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.bitbang {
            // INIT_B is released immediately.
            buf[0] = 0x20;
            return Ok(1);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.read_queue.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.bitbang {
            self.bitbang_log.extend_from_slice(data);
        } else {
            for &byte in data {
                self.process_fifo_byte(byte);
            }
        }
        Ok(data.len())
    }
}

impl BitbangBridge for SigmaSim {
    fn set_bitbang(&mut self, _pin_mask: u8, enable: bool) -> Result<()> {
        if !enable && self.bitbang {
            self.uploads.push(self.bitbang_log.len());
            self.bitbang_log.clear();
        }
        self.bitbang = enable;
        Ok(())
    }

    fn set_rate(&mut self, _bits_per_second: u32) -> Result<()> {
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        if !self.bitbang {
            self.read_queue.clear();
        }
        Ok(())
    }
}

pub fn cluster_bytes(timestamp: u16, events: &[u16]) -> [u8; 16] {
    assert!(events.len() <= 7);
    let mut out = [0u8; 16];
    out[..2].copy_from_slice(&timestamp.to_le_bytes());
    for (i, &event) in events.iter().enumerate() {
        out[2 + 2 * i..4 + 2 * i].copy_from_slice(&event.to_le_bytes());
    }
    out
}

pub fn set_row(sim: &mut SigmaSim, row: u16, clusters: &[(u16, [u16; 7])]) {
    assert!(clusters.len() <= 64);
    let mut data = Vec::with_capacity(sigma_proto::ROW_LENGTH_BYTES);
    for &(timestamp, events) in clusters {
        data.extend_from_slice(&cluster_bytes(timestamp, &events));
    }
    data.resize(sigma_proto::ROW_LENGTH_BYTES, 0);
    sim.dram.insert(row, data);
}

/// Fill a row with 64 time-adjacent clusters of a constant sample value.
pub fn fill_row(sim: &mut SigmaSim, row: u16, timestamp_base: u16, value: u16) {
    let clusters: Vec<(u16, [u16; 7])> = (0..64)
        .map(|c| (timestamp_base.wrapping_add(c * 7), [value; 7]))
        .collect();
    set_row(sim, row, &clusters);
}

/// Vendor-protocol simulator of the Kingst LA family's FX2 bridge.
pub struct La2016Sim {
    /// Responses for FPGA-init status reads; zeros once exhausted.
    pub init_reads: VecDeque<u8>,
    pub run_state: u16,
    pub pwm_en: u8,
    /// Write history per FPGA register.
    pub reg_writes: HashMap<u16, Vec<Vec<u8>>>,
    /// `wIndex` seen on the last trigger register write.
    pub trigger_windex: Option<u16>,
    /// Values written to the run register, in order.
    pub run_writes: Vec<u8>,
    pub capture_info: [u8; 12],
    pub bulk: Vec<u8>,
    cursor: usize,
    bulk_started: bool,
    uploading: bool,
    pub uploaded_bytes: usize,
    pub fpga_enabled: bool,
}

impl La2016Sim {
    pub fn new() -> Self {
        La2016Sim {
            init_reads: VecDeque::new(),
            run_state: 0x85e1,
            pwm_en: 0,
            reg_writes: HashMap::new(),
            trigger_windex: None,
            run_writes: Vec::new(),
            capture_info: [0; 12],
            bulk: Vec::new(),
            cursor: 0,
            bulk_started: false,
            uploading: false,
            uploaded_bytes: 0,
            fpga_enabled: false,
        }
    }

    pub fn set_capture_info(&mut self, n_rep_packets: u32, before_trigger: u32, write_pos: u32) {
        self.capture_info[0..4].copy_from_slice(&n_rep_packets.to_le_bytes());
        self.capture_info[4..8].copy_from_slice(&before_trigger.to_le_bytes());
        self.capture_info[8..12].copy_from_slice(&write_pos.to_le_bytes());
    }
}

impl Transport for La2016Sim {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.bulk_started || self.cursor >= self.bulk.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.bulk.len() - self.cursor);
        buf[..n].copy_from_slice(&self.bulk[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.uploading {
            self.uploaded_bytes += data.len();
        }
        Ok(data.len())
    }
}

impl ControlTransport for La2016Sim {
    fn ctrl_in(&mut self, request: u8, value: u16, _index: u16, buf: &mut [u8]) -> Result<()> {
        match request {
            la2016_proto::CMD_FPGA_INIT => {
                buf[0] = self.init_reads.pop_front().unwrap_or(0);
            }
            la2016_proto::CMD_FPGA_SPI => match value {
                la2016_proto::REG_RUN => {
                    buf[..2].copy_from_slice(&self.run_state.to_le_bytes());
                }
                la2016_proto::REG_PWM_EN => buf[0] = self.pwm_en,
                la2016_proto::REG_BULK => buf.copy_from_slice(&self.capture_info),
                _ => {
                    for slot in buf.iter_mut() {
                        *slot = 0;
                    }
                }
            },
            _ => {
                for slot in buf.iter_mut() {
                    *slot = 0;
                }
            }
        }
        Ok(())
    }

    fn ctrl_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
        match request {
            la2016_proto::CMD_FPGA_INIT => self.uploading = true,
            la2016_proto::CMD_FPGA_ENABLE => {
                self.fpga_enabled = true;
                self.uploading = false;
            }
            la2016_proto::CMD_BULK_START => self.bulk_started = true,
            la2016_proto::CMD_BULK_RESET => {
                self.bulk_started = false;
                self.cursor = 0;
            }
            la2016_proto::CMD_FPGA_SPI => {
                self.reg_writes.entry(value).or_default().push(data.to_vec());
                match value {
                    la2016_proto::REG_TRIGGER => self.trigger_windex = Some(index),
                    la2016_proto::REG_RUN => {
                        if let Some(&mode) = data.first() {
                            self.run_writes.push(mode);
                        }
                    }
                    la2016_proto::REG_PWM_EN => {
                        if let Some(&enables) = data.first() {
                            self.pwm_en = enables;
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Build one 16-byte LA transfer packet from up to five run-length pairs.
pub fn transfer_packet(pairs: &[(u16, u8)], sequence: u8) -> [u8; 16] {
    assert!(pairs.len() <= 5);
    let mut out = [0u8; 16];
    for (i, &(value, repetitions)) in pairs.iter().enumerate() {
        out[i * 3..i * 3 + 2].copy_from_slice(&value.to_le_bytes());
        out[i * 3 + 2] = repetitions;
    }
    out[15] = sequence;
    out
}
