//! Command/response engine.
//!
//! Opcodes go out on the Command link; everything the device says comes back
//! on the Data link. Responses carry no length prefix, so the engine reads
//! whatever is buffered and appends it until a terminator shows up:
//!
//! ```text
//! scalar get     : <text> 'x'
//! file listing   : <name> '\n' <name> '\n' ... "xxx"
//! file sizes     : <base-2 text> '\n'   (one line per listed file)
//! put echo       : <value>              (length known in advance)
//! delete status  : '1' | '0' 'x'
//! ```
//!
//! Every wait is bounded by [`EngineConfig::response_timeout`], measured from
//! the last byte received.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::opcode::{LISTING_SENTINEL, Opcode, SCALAR_SENTINEL};
use crate::protocol::resume::{ResumeFrame, find};
use crate::session::DeviceSession;
use log::{debug, trace, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Delay between the reset-position opcode and the framed offset.
pub const RESET_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// A file stored on the logger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileDescriptor {
    /// File name as listed by the device.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Command/response timing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on silence while waiting for a response.
    pub response_timeout: Duration,
    /// Sleep between polls of an idle link.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Issues opcodes and reads responses over a borrowed session.
pub struct ProtocolEngine<'s, P: Port> {
    session: &'s mut DeviceSession<P>,
    config: EngineConfig,
}

impl<'s, P: Port> ProtocolEngine<'s, P> {
    /// Create an engine with default timing.
    pub fn new(session: &'s mut DeviceSession<P>) -> Self {
        Self::with_config(session, EngineConfig::default())
    }

    /// Create an engine with custom timing.
    pub fn with_config(session: &'s mut DeviceSession<P>, config: EngineConfig) -> Self {
        Self { session, config }
    }

    /// Engine timing.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying session.
    pub fn session_mut(&mut self) -> &mut DeviceSession<P> {
        &mut *self.session
    }

    /// Write one opcode to the Command link.
    pub fn send(&mut self, op: Opcode) -> Result<()> {
        trace!("-> {op:?}");
        self.session.command_mut().write_all_bytes(&[op.byte()])
    }

    /// Write raw bytes to the Data link.
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("-> data {} bytes", bytes.len());
        self.session.data_mut().write_all_bytes(bytes)
    }

    /// Write `value` followed by the scalar terminator to the Data link.
    pub fn write_terminated(&mut self, value: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(value.len() + SCALAR_SENTINEL.len());
        bytes.extend_from_slice(value.as_bytes());
        bytes.extend_from_slice(SCALAR_SENTINEL);
        self.write_data(&bytes)
    }

    /// Discard stale input on both links.
    pub fn flush_all(&mut self) -> Result<()> {
        self.session.flush_all()
    }

    /// Poll the Data link, feeding every received piece to `done` until it
    /// reports completion.
    fn accumulate<F>(&mut self, what: &str, done: F) -> Result<Vec<u8>>
    where
        F: FnMut(&[u8]) -> Result<bool>,
    {
        self.accumulate_inner(what, false, done)
    }

    /// Like [`Self::accumulate`], but silence after at least one byte ends
    /// the read with whatever arrived instead of failing.
    fn accumulate_partial<F>(&mut self, what: &str, done: F) -> Result<Vec<u8>>
    where
        F: FnMut(&[u8]) -> Result<bool>,
    {
        self.accumulate_inner(what, true, done)
    }

    fn accumulate_inner<F>(
        &mut self,
        what: &str,
        keep_partial: bool,
        mut done: F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(&[u8]) -> Result<bool>,
    {
        let mut buf = Vec::new();
        let mut last_progress = Instant::now();

        loop {
            let piece = self.session.data_mut().read_available(usize::MAX)?;
            if piece.is_empty() {
                if last_progress.elapsed() >= self.config.response_timeout {
                    if keep_partial && !buf.is_empty() {
                        debug!("{what} went silent after {} bytes", buf.len());
                        return Ok(buf);
                    }
                    return Err(Error::Timeout(format!(
                        "waiting for {what} ({} bytes so far)",
                        buf.len()
                    )));
                }
                thread::sleep(self.config.poll_interval);
                continue;
            }

            trace!("<- data {} bytes", piece.len());
            buf.extend_from_slice(&piece);
            last_progress = Instant::now();

            if done(&buf)? {
                return Ok(buf);
            }
        }
    }

    /// Read until `sentinel` appears and return the bytes before it.
    ///
    /// Anything after the sentinel is discarded.
    pub fn read_until_sentinel(&mut self, sentinel: &[u8]) -> Result<Vec<u8>> {
        let mut buf = self.accumulate("response sentinel", |buf| {
            Ok(find(buf, sentinel).is_some())
        })?;
        if let Some(pos) = find(&buf, sentinel) {
            buf.truncate(pos);
        }
        Ok(buf)
    }

    fn read_text_until(&mut self, sentinel: &[u8]) -> Result<String> {
        let bytes = self.read_until_sentinel(sentinel)?;
        String::from_utf8(bytes)
            .map_err(|e| Error::Protocol(format!("response is not UTF-8: {e}")))
    }

    fn read_lines(&mut self, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let buf = self.accumulate("size lines", |buf| {
            Ok(buf.iter().filter(|b| **b == b'\n').count() >= count)
        })?;
        let text = String::from_utf8(buf)
            .map_err(|e| Error::Protocol(format!("size listing is not UTF-8: {e}")))?;
        Ok(text
            .split('\n')
            .take(count)
            .map(|line| line.trim().to_string())
            .collect())
    }

    fn read_at_least(&mut self, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            // Nothing to wait for; take whatever already arrived
            return self.session.data_mut().read_available(usize::MAX);
        }
        self.accumulate_partial("echo", |buf| Ok(buf.len() >= len))
    }

    /// List the names of all files on the device.
    pub fn list_files(&mut self) -> Result<Vec<String>> {
        self.flush_all()?;
        self.send(Opcode::ListFiles)?;

        let listing = self.read_text_until(LISTING_SENTINEL)?;
        let names: Vec<String> = listing
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        debug!("Device lists {} file(s)", names.len());
        Ok(names)
    }

    /// Read the sizes of the first `count` files, in listing order.
    pub fn list_sizes(&mut self, count: usize) -> Result<Vec<u64>> {
        self.flush_all()?;
        self.send(Opcode::ListSizes)?;

        self.read_lines(count)?
            .into_iter()
            .map(|line| {
                u64::from_str_radix(&line, 2)
                    .map_err(|_| Error::Protocol(format!("size {line:?} is not base-2")))
            })
            .collect()
    }

    /// List every file with its size.
    pub fn list_file_descriptors(&mut self) -> Result<Vec<FileDescriptor>> {
        let names = self.list_files()?;
        let sizes = self.list_sizes(names.len())?;
        Ok(names
            .into_iter()
            .zip(sizes)
            .map(|(name, size)| FileDescriptor { name, size })
            .collect())
    }

    /// Delete one file. Returns whether the device reported success.
    pub fn delete_file(&mut self, name: &str) -> Result<bool> {
        self.flush_all()?;
        self.send(Opcode::DeleteFile)?;
        // The filename follows the opcode on the Command link, unterminated
        self.session.command_mut().write_all_bytes(name.as_bytes())?;

        let status = self.read_text_until(SCALAR_SENTINEL)?;
        match status.trim() {
            "1" => Ok(true),
            "0" => {
                warn!("Device failed to delete {name}");
                Ok(false)
            },
            other => Err(Error::Protocol(format!(
                "unexpected delete status {other:?}"
            ))),
        }
    }

    /// Delete every listed file. Returns whether the device is empty afterwards.
    pub fn delete_all_files(&mut self) -> Result<bool> {
        for name in self.list_files()? {
            self.delete_file(&name)?;
        }

        let remaining = self.list_files()?;
        if !remaining.is_empty() {
            warn!("{} file(s) left after delete", remaining.len());
        }
        Ok(remaining.is_empty())
    }

    /// Issue a scalar get opcode and return the text before the sentinel.
    pub fn get_text(&mut self, op: Opcode) -> Result<String> {
        self.flush_all()?;
        self.send(op)?;
        self.read_text_until(SCALAR_SENTINEL)
    }

    /// Issue a scalar put opcode, write `value` and compare the echo.
    ///
    /// A mismatch is reported as `Ok(false)`, never as an error. That
    /// includes an echo that stops short of the value's length; only a
    /// device that echoes nothing at all times out.
    pub fn put_text(&mut self, op: Opcode, value: &str) -> Result<bool> {
        self.flush_all()?;
        self.send(op)?;
        self.write_terminated(value)?;

        let echo = self.read_at_least(value.len())?;
        let echo = String::from_utf8_lossy(&echo);
        let echo = echo.trim_end_matches(['\r', '\n']);
        let echo = echo.strip_suffix('x').unwrap_or(echo);

        let matched = echo == value;
        if !matched {
            warn!("{op:?} echo mismatch: sent {value:?}, device echoed {echo:?}");
        }
        Ok(matched)
    }

    /// Open a file for chunked reading.
    pub fn open_file(&mut self, name: &str) -> Result<()> {
        self.send(Opcode::OpenFile)?;
        self.write_terminated(name)
    }

    /// Ask the device for the next chunk of the open file.
    pub fn request_chunk(&mut self) -> Result<()> {
        self.send(Opcode::NextChunk)
    }

    /// Close the open file.
    pub fn close_file(&mut self) -> Result<()> {
        self.send(Opcode::CloseFile)
    }

    /// Seek the open file and return the offset the device confirmed.
    pub fn reset_position(&mut self, frame: ResumeFrame) -> Result<ResumeFrame> {
        self.send(Opcode::ResetPosition)?;
        thread::sleep(RESET_SETTLE_DELAY);
        self.write_data(&frame.encode())?;

        let buf = self.accumulate("resume echo", |buf| {
            Ok(ResumeFrame::decode(buf)?.is_some())
        })?;
        let echoed = ResumeFrame::decode(&buf)?
            .ok_or_else(|| Error::Protocol("resume echo vanished".into()))?;

        // Leftover bytes from the aborted chunk must not leak into the retry
        self.session.data_mut().clear_input()?;
        Ok(echoed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::sim::SimDevice;

    fn quick() -> EngineConfig {
        EngineConfig {
            response_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_list_files_is_idempotent() {
        let device = SimDevice::new()
            .with_file("run1.bin", vec![1; 10])
            .with_file("run2.bin", vec![2; 20])
            .with_file("notes.txt", vec![3; 30]);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        let first = engine.list_files().unwrap();
        let second = engine.list_files().unwrap();
        assert_eq!(first, vec!["run1.bin", "run2.bin", "notes.txt"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_list_files_empty_device() {
        let device = SimDevice::new();
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        assert!(engine.list_files().unwrap().is_empty());
        assert!(engine.list_file_descriptors().unwrap().is_empty());
    }

    #[test]
    fn test_list_file_descriptors_parses_base2_sizes() {
        let device = SimDevice::new()
            .with_file("A", vec![0; 10240])
            .with_file("B", vec![0; 7000]);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        let files = engine.list_file_descriptors().unwrap();
        assert_eq!(
            files,
            vec![
                FileDescriptor {
                    name: "A".into(),
                    size: 10240
                },
                FileDescriptor {
                    name: "B".into(),
                    size: 7000
                },
            ]
        );
    }

    #[test]
    fn test_delete_file_and_delete_all() {
        let device = SimDevice::new()
            .with_file("a.bin", vec![0; 4])
            .with_file("b.bin", vec![0; 4])
            .with_file("c.bin", vec![0; 4]);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        assert!(engine.delete_file("b.bin").unwrap());
        assert!(!engine.delete_file("missing.bin").unwrap());
        assert_eq!(device.file_names(), vec!["a.bin", "c.bin"]);

        assert!(engine.delete_all_files().unwrap());
        assert!(device.file_names().is_empty());
    }

    #[test]
    fn test_get_text_strips_sentinel() {
        let device = SimDevice::new().with_device_id("LOGGER-42");
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        assert_eq!(engine.get_text(Opcode::GetDeviceId).unwrap(), "LOGGER-42");
    }

    #[test]
    fn test_put_text_compares_echo() {
        let device = SimDevice::new();
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        assert!(engine.put_text(Opcode::PutDeviceId, "UNIT-7").unwrap());
        assert_eq!(device.device_id(), "UNIT-7");
    }

    #[test]
    fn test_put_text_value_cut_at_sentinel_is_mismatch() {
        let device = SimDevice::new();
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        // The device stops reading the value at the first `x`
        assert!(!engine.put_text(Opcode::PutDeviceId, "AB-x-CD").unwrap());
        assert_eq!(device.device_id(), "AB-");
    }

    #[test]
    fn test_put_text_short_echo_is_mismatch() {
        let device = SimDevice::new().truncate_put_echo(2);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        assert!(!engine.put_text(Opcode::PutFirmwareVersion, "std-1.4").unwrap());
    }

    #[test]
    fn test_put_text_silence_times_out() {
        let device = SimDevice::new().truncate_put_echo(0);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        let result = engine.put_text(Opcode::PutDeviceId, "UNIT-7");
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_list_sizes_rejects_non_base2_line() {
        let device = SimDevice::new()
            .with_file("A", vec![0; 4])
            .with_size_listing("12\r\n");
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        assert!(matches!(engine.list_sizes(1), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_missing_sentinel_times_out() {
        let device = SimDevice::new();
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        // Nothing answers a bare close opcode
        engine.close_file().unwrap();
        let result = engine.read_until_sentinel(SCALAR_SENTINEL);
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_reset_position_echo() {
        let device = SimDevice::new().with_file("A", vec![7; 10240]);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick());

        engine.open_file("A").unwrap();
        let echoed = engine.reset_position(ResumeFrame::new(5120)).unwrap();
        assert_eq!(echoed.offset(), 5120);
        assert_eq!(device.resume_frames(), vec![ResumeFrame::new(5120).encode()]);
    }
}
