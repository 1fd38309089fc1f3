//! In-process logger simulator.
//!
//! [`SimDevice`] implements the firmware side of the dual-link protocol and
//! hands out two [`SimPort`]s that behave like the logger's USB serial
//! links: bytes written to the command link drive the device, responses
//! appear on the data link after an optional delay. Faults seen on real
//! hardware can be scripted: stalled chunks, slow trickling chunks, wrong
//! resume echoes, short put echoes and broken identify answers.
//!
//! ```rust
//! use casslog::port::sim::SimDevice;
//!
//! let device = SimDevice::new().with_file("run1.bin", vec![0u8; 10240]);
//! let session = device.session();
//! # drop(session);
//! ```

use crate::error::Result;
use crate::port::{DEFAULT_BAUD, Port};
use crate::protocol::opcode::{IDENTIFY_ACK, LISTING_SENTINEL, Opcode, SCALAR_SENTINEL};
use crate::protocol::resume::ResumeFrame;
use crate::session::DeviceSession;
use crate::transfer::CHUNK_SIZE;
use chrono::NaiveDateTime;
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How the simulated firmware answers the identify opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentifyMode {
    /// Acknowledge on the command link only (real firmware).
    #[default]
    Command,
    /// Acknowledge on both links.
    Both,
    /// Never answer.
    Silent,
    /// Answer on the command link with a byte other than the acknowledgement.
    WrongByte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    DeviceId,
    FirmwareVersion,
    InstallEpoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Nothing,
    OpenName,
    DeleteName,
    Value(Field),
    RtcValue,
    ResumeOffset,
}

struct Segment {
    ready_at: Instant,
    bytes: Vec<u8>,
    pos: usize,
}

/// Bytes travelling from the device to the host on one link.
#[derive(Default)]
struct Outbox {
    segments: VecDeque<Segment>,
}

impl Outbox {
    fn push(&mut self, bytes: &[u8]) {
        self.push_at(Instant::now(), bytes);
    }

    fn push_at(&mut self, ready_at: Instant, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.segments.push_back(Segment {
                ready_at,
                bytes: bytes.to_vec(),
                pos: 0,
            });
        }
    }

    fn ready_len(&self, now: Instant) -> usize {
        self.segments
            .iter()
            .take_while(|s| s.ready_at <= now)
            .map(|s| s.bytes.len() - s.pos)
            .sum()
    }

    fn take(&mut self, buf: &mut [u8], now: Instant) -> usize {
        let mut n = 0;
        while n < buf.len() {
            let Some(seg) = self.segments.front_mut() else {
                break;
            };
            if seg.ready_at > now {
                break;
            }
            let k = (seg.bytes.len() - seg.pos).min(buf.len() - n);
            buf[n..n + k].copy_from_slice(&seg.bytes[seg.pos..seg.pos + k]);
            seg.pos += k;
            n += k;
            if seg.pos == seg.bytes.len() {
                self.segments.pop_front();
            }
        }
        n
    }

    fn clear(&mut self) {
        self.segments.clear();
    }
}

struct OpenFile {
    contents: Vec<u8>,
    pos: usize,
}

struct DeviceState {
    command_first: bool,
    identify: IdentifyMode,
    files: Vec<(String, Vec<u8>)>,
    device_id: String,
    firmware_version: String,
    rtc: String,
    install_epoch: String,
    chunk_size: usize,
    open: Option<OpenFile>,
    awaiting: Awaiting,
    inbox: Vec<u8>,
    outbox: [Outbox; 2],
    closed: [bool; 2],
    stalls: HashMap<u64, u32>,
    trickle: Option<(usize, Duration)>,
    echo_skew: i64,
    echo_limit: Option<usize>,
    size_listing: Option<String>,
    chunk_requests: usize,
    resume_frames: Vec<Vec<u8>>,
}

impl DeviceState {
    fn command_channel(&self) -> usize {
        if self.command_first { 0 } else { 1 }
    }

    fn data_channel(&self) -> usize {
        1 - self.command_channel()
    }

    fn reply(&mut self, bytes: &[u8]) {
        let data = self.data_channel();
        self.outbox[data].push(bytes);
    }

    fn on_write(&mut self, channel: usize, bytes: &[u8]) {
        if channel == self.command_channel() {
            self.on_command(bytes);
        } else {
            self.on_data(channel, bytes);
        }
    }

    fn on_command(&mut self, bytes: &[u8]) {
        if self.awaiting == Awaiting::DeleteName {
            self.awaiting = Awaiting::Nothing;
            let name = String::from_utf8_lossy(bytes).into_owned();
            let before = self.files.len();
            self.files.retain(|(n, _)| *n != name);
            let deleted = self.files.len() < before;
            self.reply(if deleted { b"1x" } else { b"0x" });
            return;
        }

        for &byte in bytes {
            match Opcode::from_byte(byte) {
                Some(op) => self.dispatch(op),
                None => trace!("sim: ignoring command byte 0x{byte:02X}"),
            }
        }
    }

    fn dispatch(&mut self, op: Opcode) {
        trace!("sim: {op:?}");
        match op {
            Opcode::Identify => {
                let command = self.command_channel();
                match self.identify {
                    IdentifyMode::Silent => {},
                    IdentifyMode::WrongByte => self.outbox[command].push(b"?"),
                    IdentifyMode::Command | IdentifyMode::Both => {
                        self.outbox[command].push(&[IDENTIFY_ACK]);
                    },
                }
            },
            Opcode::ListFiles => {
                let mut listing = Vec::new();
                for (name, _) in &self.files {
                    listing.extend_from_slice(name.as_bytes());
                    listing.push(b'\n');
                }
                listing.extend_from_slice(LISTING_SENTINEL);
                self.reply(&listing);
            },
            Opcode::ListSizes => {
                let sizes: String = self.size_listing.clone().unwrap_or_else(|| {
                    self.files
                        .iter()
                        .map(|(_, contents)| format!("{:b}\r\n", contents.len()))
                        .collect()
                });
                self.reply(sizes.as_bytes());
            },
            Opcode::OpenFile => self.expect(Awaiting::OpenName),
            Opcode::NextChunk => self.send_chunk(),
            Opcode::CloseFile => self.open = None,
            Opcode::DeleteFile => self.awaiting = Awaiting::DeleteName,
            Opcode::ResetPosition => self.expect(Awaiting::ResumeOffset),
            Opcode::GetDeviceId => self.reply_scalar(&self.device_id.clone()),
            Opcode::GetFirmwareVersion => self.reply_scalar(&self.firmware_version.clone()),
            Opcode::GetRtc => self.reply_scalar(&self.rtc.clone()),
            Opcode::GetInstallEpoch => self.reply_scalar(&self.install_epoch.clone()),
            Opcode::PutDeviceId => self.expect(Awaiting::Value(Field::DeviceId)),
            Opcode::PutFirmwareVersion => self.expect(Awaiting::Value(Field::FirmwareVersion)),
            Opcode::PutInstallEpoch => self.expect(Awaiting::Value(Field::InstallEpoch)),
            Opcode::SetRtc => self.expect(Awaiting::RtcValue),
        }
    }

    fn expect(&mut self, awaiting: Awaiting) {
        self.awaiting = awaiting;
        self.inbox.clear();
    }

    fn reply_scalar(&mut self, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.extend_from_slice(SCALAR_SENTINEL);
        self.reply(&bytes);
    }

    fn send_chunk(&mut self) {
        self.chunk_requests += 1;
        let chunk_size = self.chunk_size;
        let Some(open) = self.open.as_mut() else {
            return;
        };

        let chunk_index = (open.pos / chunk_size) as u64;
        let end = (open.pos + chunk_size).min(open.contents.len());
        let chunk = open.contents[open.pos..end].to_vec();
        open.pos = end;

        let stall = self.stalls.get_mut(&chunk_index).filter(|n| **n > 0);
        if let Some(remaining) = stall {
            *remaining -= 1;
            // Device hangs half way through the chunk
            let half = chunk.len() / 2;
            self.reply(&chunk[..half]);
            return;
        }

        match self.trickle {
            Some((piece_len, interval)) => {
                let data = self.data_channel();
                let start = Instant::now();
                for (i, piece) in chunk.chunks(piece_len.max(1)).enumerate() {
                    self.outbox[data].push_at(start + interval * i as u32, piece);
                }
            },
            None => self.reply(&chunk),
        }
    }

    fn on_data(&mut self, channel: usize, bytes: &[u8]) {
        match self.awaiting {
            Awaiting::Nothing => {
                if bytes == [Opcode::Identify.byte()] && self.identify == IdentifyMode::Both {
                    self.outbox[channel].push(&[IDENTIFY_ACK]);
                }
            },
            Awaiting::DeleteName => {},
            Awaiting::ResumeOffset => {
                self.inbox.extend_from_slice(bytes);
                if let Ok(Some(frame)) = ResumeFrame::decode(&self.inbox) {
                    self.resume_frames.push(std::mem::take(&mut self.inbox));
                    self.awaiting = Awaiting::Nothing;
                    self.seek(frame.offset());
                }
            },
            Awaiting::OpenName | Awaiting::Value(_) | Awaiting::RtcValue => {
                self.inbox.extend_from_slice(bytes);
                if let Some(end) = self.inbox.iter().position(|b| *b == SCALAR_SENTINEL[0]) {
                    let value = String::from_utf8_lossy(&self.inbox[..end]).into_owned();
                    let awaiting = self.awaiting;
                    self.awaiting = Awaiting::Nothing;
                    self.inbox.clear();
                    self.accept_value(awaiting, value);
                }
            },
        }
    }

    fn accept_value(&mut self, awaiting: Awaiting, value: String) {
        match awaiting {
            Awaiting::OpenName => {
                self.open = self
                    .files
                    .iter()
                    .find(|(name, _)| *name == value)
                    .map(|(_, contents)| OpenFile {
                        contents: contents.clone(),
                        pos: 0,
                    });
            },
            Awaiting::Value(field) => {
                let limit = self.echo_limit.unwrap_or(value.len()).min(value.len());
                self.reply(&value.as_bytes()[..limit]);
                match field {
                    Field::DeviceId => self.device_id = value,
                    Field::FirmwareVersion => self.firmware_version = value,
                    Field::InstallEpoch => self.install_epoch = value,
                }
            },
            Awaiting::RtcValue => {
                let unix = NaiveDateTime::parse_from_str(&value, "%Y-%m-%d %H:%M:%S")
                    .map(|dt| dt.and_utc().timestamp().to_string())
                    .unwrap_or_default();
                if !unix.is_empty() {
                    self.rtc = value;
                }
                self.reply_scalar(&unix);
            },
            Awaiting::Nothing | Awaiting::DeleteName | Awaiting::ResumeOffset => {},
        }
    }

    fn seek(&mut self, offset: u64) {
        if let Some(open) = self.open.as_mut() {
            open.pos = (offset as usize).min(open.contents.len());
        }
        let echoed = offset.saturating_add_signed(self.echo_skew);
        self.reply(&ResumeFrame::new(echoed).encode());
    }
}

/// A simulated logger.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// A logger with no files, default fields and command on the first port.
    pub fn new() -> Self {
        let state = DeviceState {
            command_first: true,
            identify: IdentifyMode::Command,
            files: Vec::new(),
            device_id: "CASS-0001".to_string(),
            firmware_version: "std-1.0".to_string(),
            rtc: "2024-01-01 00:00:00".to_string(),
            install_epoch: "1704067200".to_string(),
            chunk_size: CHUNK_SIZE,
            open: None,
            awaiting: Awaiting::Nothing,
            inbox: Vec::new(),
            outbox: [Outbox::default(), Outbox::default()],
            closed: [true, true],
            stalls: HashMap::new(),
            trickle: None,
            echo_skew: 0,
            echo_limit: None,
            size_listing: None,
            chunk_requests: 0,
            resume_frames: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(self, f: impl FnOnce(&mut DeviceState)) -> Self {
        f(&mut self.lock());
        self
    }

    /// Add a file to the device's storage.
    #[must_use]
    pub fn with_file(self, name: &str, contents: Vec<u8>) -> Self {
        let name = name.to_string();
        self.update(|s| s.files.push((name, contents)))
    }

    /// Set the stored device id.
    #[must_use]
    pub fn with_device_id(self, id: &str) -> Self {
        let id = id.to_string();
        self.update(|s| s.device_id = id)
    }

    /// Set the stored firmware version.
    #[must_use]
    pub fn with_firmware_version(self, version: &str) -> Self {
        let version = version.to_string();
        self.update(|s| s.firmware_version = version)
    }

    /// Choose whether the first port returned by [`Self::ports`] is the command link.
    #[must_use]
    pub fn with_command_first(self, command_first: bool) -> Self {
        self.update(|s| s.command_first = command_first)
    }

    /// Choose how identify is answered.
    #[must_use]
    pub fn with_identify_mode(self, mode: IdentifyMode) -> Self {
        self.update(|s| s.identify = mode)
    }

    /// Override the chunk size the firmware streams.
    #[must_use]
    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        self.update(|s| s.chunk_size = chunk_size)
    }

    /// Stop half way through `chunk_index` the next `times` times it is requested.
    #[must_use]
    pub fn stall_chunk(self, chunk_index: u64, times: u32) -> Self {
        self.update(|s| {
            s.stalls.insert(chunk_index, times);
        })
    }

    /// Deliver chunks in `piece_len` pieces spaced `interval` apart.
    #[must_use]
    pub fn trickle(self, piece_len: usize, interval: Duration) -> Self {
        self.update(|s| s.trickle = Some((piece_len, interval)))
    }

    /// Echo resume offsets shifted by `delta` bytes.
    #[must_use]
    pub fn skew_resume_echo(self, delta: i64) -> Self {
        self.update(|s| s.echo_skew = delta)
    }

    /// Echo at most `len` bytes of each written field value.
    #[must_use]
    pub fn truncate_put_echo(self, len: usize) -> Self {
        self.update(|s| s.echo_limit = Some(len))
    }

    /// Answer the size listing with `text` instead of the stored sizes.
    #[must_use]
    pub fn with_size_listing(self, text: &str) -> Self {
        let text = text.to_string();
        self.update(|s| s.size_listing = Some(text))
    }

    /// Open both links, in enumeration order.
    pub fn ports(&self) -> (SimPort, SimPort) {
        let mut state = self.lock();
        state.closed = [false, false];
        drop(state);
        (self.port(0), self.port(1))
    }

    /// Open both links and label them without negotiating.
    pub fn session(&self) -> DeviceSession<SimPort> {
        let command_first = self.lock().command_first;
        let (first, second) = self.ports();
        if command_first {
            DeviceSession::new(second, first)
        } else {
            DeviceSession::new(first, second)
        }
    }

    fn port(&self, channel: usize) -> SimPort {
        SimPort {
            state: Arc::clone(&self.state),
            channel,
            name: format!("sim.usbmodem{}", channel + 1),
        }
    }

    /// Whether `port` is the device's command link.
    pub fn is_command_port(&self, port: &SimPort) -> bool {
        port.channel == self.lock().command_channel()
    }

    /// Whether both links are closed.
    pub fn all_closed(&self) -> bool {
        self.lock().closed.iter().all(|c| *c)
    }

    /// Number of next-chunk opcodes received.
    pub fn chunk_requests(&self) -> usize {
        self.lock().chunk_requests
    }

    /// Raw bytes of every framed offset received on the data link.
    pub fn resume_frames(&self) -> Vec<Vec<u8>> {
        self.lock().resume_frames.clone()
    }

    /// Names of the stored files, in listing order.
    pub fn file_names(&self) -> Vec<String> {
        self.lock().files.iter().map(|(n, _)| n.clone()).collect()
    }

    /// The stored device id.
    pub fn device_id(&self) -> String {
        self.lock().device_id.clone()
    }

    /// The stored RTC string.
    pub fn rtc(&self) -> String {
        self.lock().rtc.clone()
    }
}

/// One link of a [`SimDevice`].
pub struct SimPort {
    state: Arc<Mutex<DeviceState>>,
    channel: usize,
    name: String,
}

impl SimPort {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.lock().closed[self.channel] {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        Ok(())
    }
}

impl Port for SimPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn baud_rate(&self) -> u32 {
        DEFAULT_BAUD
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        self.check_open()?;
        Ok(self.lock().outbox[self.channel].ready_len(Instant::now()))
    }

    fn clear_input(&mut self) -> Result<()> {
        self.check_open()?;
        let channel = self.channel;
        self.lock().outbox[channel].clear();
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.clear_input()
    }

    fn is_open(&self) -> bool {
        !self.lock().closed[self.channel]
    }

    fn close(&mut self) -> Result<()> {
        let channel = self.channel;
        self.lock().closed[channel] = true;
        Ok(())
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let channel = self.channel;
        let n = self.lock().outbox[channel].take(buf, Instant::now());
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        Ok(n)
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        let channel = self.channel;
        self.lock().on_write(channel, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SimPort {
    fn drop(&mut self) {
        let channel = self.channel;
        self.lock().closed[channel] = true;
    }
}
