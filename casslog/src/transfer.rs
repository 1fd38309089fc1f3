//! Chunked file download with stall recovery.
//!
//! ```text
//! Idle -> Opening -> Streaming -> Closing -> Done
//!                      |    ^
//!                      v    |
//!                   Recovering
//! ```
//!
//! The host opens a file, then requests it one fixed-size chunk at a time.
//! Only whole chunks are requested: a file of `size` bytes yields
//! `size / chunk_size` chunks and the trailing partial chunk is never read.
//!
//! A chunk that stops arriving for longer than the stall timeout (measured
//! from the last byte received, not from the request) is recovered once: the
//! host seeks the device back to the chunk's first byte with a framed offset
//! and asks for the chunk again. A second stall on the same chunk, or a
//! device that confirms a different offset, aborts the download.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::engine::{FileDescriptor, ProtocolEngine};
use crate::protocol::resume::ResumeFrame;
use log::{debug, info, trace, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Bytes per chunk the firmware streams.
pub const CHUNK_SIZE: usize = 5120;

/// Default silence tolerated mid-chunk.
pub const STALL_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of chunks requested for a file of `size` bytes.
pub fn requested_chunks(size: u64, chunk_size: usize) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size / chunk_size as u64
}

/// Transfer settings.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Silence tolerated mid-chunk before a resume.
    pub stall_timeout: Duration,
    /// Sleep between polls of an idle Data link.
    pub poll_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            stall_timeout: STALL_TIMEOUT,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Download state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Nothing sent yet.
    Idle,
    /// Open opcode and filename sent.
    Opening,
    /// Receiving chunks.
    Streaming,
    /// Seeking the device back after a stall.
    Recovering,
    /// Close opcode sent.
    Closing,
    /// Every requested chunk received.
    Done,
}

/// Progress of one download.
#[derive(Debug, Clone)]
pub struct TransferState {
    /// File being downloaded.
    pub filename: String,
    /// Size the device listed.
    pub total_size: u64,
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Chunk currently being received.
    pub chunk_index: u64,
    /// Bytes received so far, including the partial current chunk.
    pub bytes_received: u64,
    /// When the current chunk is declared stalled, if one is in flight.
    pub stall_deadline: Option<Instant>,
    /// Current phase.
    pub phase: TransferPhase,
}

impl TransferState {
    fn new(file: &FileDescriptor, chunk_size: usize) -> Self {
        Self {
            filename: file.name.clone(),
            total_size: file.size,
            chunk_size,
            chunk_index: 0,
            bytes_received: 0,
            stall_deadline: None,
            phase: TransferPhase::Idle,
        }
    }

    fn enter(&mut self, phase: TransferPhase) {
        trace!("{}: {:?} -> {:?}", self.filename, self.phase, phase);
        self.phase = phase;
    }

    fn chunk_start(&self) -> u64 {
        self.chunk_index * self.chunk_size as u64
    }

    fn debug_check(&self) {
        debug_assert!(self.bytes_received <= self.chunk_start() + self.chunk_size as u64);
    }
}

/// Outcome of one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// File name.
    pub filename: String,
    /// Size the device listed.
    pub listed_size: u64,
    /// Whole chunks requested.
    pub requested_chunks: u64,
    /// `requested_chunks * chunk_size`.
    pub expected_bytes: u64,
    /// Bytes actually kept.
    pub bytes_received: u64,
    /// `expected_bytes - bytes_received`.
    pub shortfall: u64,
    /// Reset-position exchanges performed.
    pub resumes: u32,
}

impl TransferReport {
    /// Bytes of the listed size that were never requested.
    pub fn dropped_tail(&self) -> u64 {
        self.listed_size.saturating_sub(self.expected_bytes)
    }
}

/// A downloaded file held in memory.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    /// File contents.
    pub data: Vec<u8>,
    /// How the download went.
    pub report: TransferReport,
}

/// Drives one file download over a protocol engine.
pub struct FileTransfer<'e, 's, P: Port> {
    engine: &'e mut ProtocolEngine<'s, P>,
    config: TransferConfig,
    state: TransferState,
    resumes: u32,
}

impl<'e, 's, P: Port> FileTransfer<'e, 's, P> {
    /// Prepare a download of `file`.
    pub fn new(
        engine: &'e mut ProtocolEngine<'s, P>,
        file: &FileDescriptor,
        config: TransferConfig,
    ) -> Self {
        let state = TransferState::new(file, config.chunk_size);
        Self {
            engine,
            config,
            state,
            resumes: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Run the download to completion.
    ///
    /// `progress` is called after each chunk with (bytes received, bytes expected).
    pub fn run<F>(mut self, mut progress: F) -> Result<DownloadedFile>
    where
        F: FnMut(u64, u64),
    {
        let chunk_size = self.config.chunk_size;
        let chunks = requested_chunks(self.state.total_size, chunk_size);
        let expected = chunks * chunk_size as u64;

        debug!(
            "Downloading {} ({} bytes, {} chunk(s))",
            self.state.filename, self.state.total_size, chunks
        );

        self.state.enter(TransferPhase::Opening);
        let filename = self.state.filename.clone();
        self.engine.open_file(&filename)?;

        self.state.enter(TransferPhase::Streaming);
        let mut data = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));
        for chunk_index in 0..chunks {
            self.state.chunk_index = chunk_index;
            let chunk = self.fetch_chunk()?;
            data.extend_from_slice(&chunk);
            progress(data.len() as u64, expected);
        }

        self.state.enter(TransferPhase::Closing);
        self.engine.close_file()?;
        self.state.stall_deadline = None;
        self.state.enter(TransferPhase::Done);

        let received = data.len() as u64;
        let report = TransferReport {
            filename,
            listed_size: self.state.total_size,
            requested_chunks: chunks,
            expected_bytes: expected,
            bytes_received: received,
            shortfall: expected.saturating_sub(received),
            resumes: self.resumes,
        };

        if report.shortfall > 0 {
            warn!(
                "{}: received {} of {} expected bytes",
                report.filename, received, expected
            );
        }
        if report.dropped_tail() > 0 {
            debug!(
                "{}: last {} byte(s) not requested",
                report.filename,
                report.dropped_tail()
            );
        }

        Ok(DownloadedFile { data, report })
    }

    /// Receive the current chunk, resuming at most once.
    fn fetch_chunk(&mut self) -> Result<Vec<u8>> {
        if let Some(chunk) = self.receive_chunk()? {
            return Ok(chunk);
        }

        self.recover()?;

        self.receive_chunk()?.ok_or_else(|| Error::ResumeFailed {
            chunk_index: self.state.chunk_index,
            offset: self.state.chunk_start(),
            reason: "chunk stalled again after resume".into(),
        })
    }

    /// Request the current chunk and read it. `None` means it stalled.
    fn receive_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let chunk_size = self.config.chunk_size;
        let start = self.state.chunk_start();

        self.engine.request_chunk()?;

        let mut chunk = Vec::with_capacity(chunk_size);
        let mut deadline = Instant::now() + self.config.stall_timeout;
        self.state.stall_deadline = Some(deadline);

        while chunk.len() < chunk_size {
            let piece = self
                .engine
                .session_mut()
                .data_mut()
                .read_available(chunk_size - chunk.len())?;

            if piece.is_empty() {
                if Instant::now() >= deadline {
                    warn!(
                        "{}: chunk {} stalled after {} of {} bytes",
                        self.state.filename,
                        self.state.chunk_index,
                        chunk.len(),
                        chunk_size
                    );
                    self.state.bytes_received = start;
                    self.state.stall_deadline = None;
                    return Ok(None);
                }
                thread::sleep(self.config.poll_interval);
                continue;
            }

            chunk.extend_from_slice(&piece);
            deadline = Instant::now() + self.config.stall_timeout;
            self.state.stall_deadline = Some(deadline);
            self.state.bytes_received = start + chunk.len() as u64;
            self.state.debug_check();
        }

        trace!("{}: chunk {} complete", self.state.filename, self.state.chunk_index);
        Ok(Some(chunk))
    }

    /// Seek the device back to the start of the current chunk.
    fn recover(&mut self) -> Result<()> {
        self.state.enter(TransferPhase::Recovering);

        let chunk_index = self.state.chunk_index;
        let frame = ResumeFrame::for_chunk(chunk_index, self.config.chunk_size);
        let resume_failed = |reason: String| Error::ResumeFailed {
            chunk_index,
            offset: frame.offset(),
            reason,
        };

        // Discard the partial chunk still in flight
        self.engine.session_mut().data_mut().clear_input()?;

        let echoed = match self.engine.reset_position(frame) {
            Ok(echoed) => echoed,
            Err(Error::Timeout(msg) | Error::Protocol(msg)) => return Err(resume_failed(msg)),
            Err(e) => return Err(e),
        };
        self.resumes += 1;

        if echoed != frame {
            return Err(resume_failed(format!(
                "device confirmed offset {}",
                echoed.offset()
            )));
        }

        info!(
            "{}: resumed chunk {} at offset {}",
            self.state.filename,
            chunk_index,
            frame.offset()
        );
        self.state.enter(TransferPhase::Streaming);
        Ok(())
    }
}

impl<P: Port> ProtocolEngine<'_, P> {
    /// Download one file with default transfer settings.
    pub fn download_file(&mut self, file: &FileDescriptor) -> Result<DownloadedFile> {
        self.download_file_with_config(file, TransferConfig::default())
    }

    /// Download one file.
    pub fn download_file_with_config(
        &mut self,
        file: &FileDescriptor,
        config: TransferConfig,
    ) -> Result<DownloadedFile> {
        FileTransfer::new(self, file, config).run(|_, _| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::sim::SimDevice;
    use crate::protocol::engine::EngineConfig;

    fn quick_engine() -> EngineConfig {
        EngineConfig {
            response_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn descriptor(name: &str, size: usize) -> FileDescriptor {
        FileDescriptor {
            name: name.to_string(),
            size: size as u64,
        }
    }

    #[test]
    fn test_requested_chunks() {
        assert_eq!(requested_chunks(0, CHUNK_SIZE), 0);
        assert_eq!(requested_chunks(5119, CHUNK_SIZE), 0);
        assert_eq!(requested_chunks(5120, CHUNK_SIZE), 1);
        assert_eq!(requested_chunks(7000, CHUNK_SIZE), 1);
        assert_eq!(requested_chunks(10240, CHUNK_SIZE), 2);
        for size in [1u64, 99, 4096, 51_199, 51_200, 1_000_000] {
            assert_eq!(requested_chunks(size, CHUNK_SIZE), size / 5120);
        }
    }

    #[test]
    fn test_download_whole_chunks() {
        let contents = pattern(3 * CHUNK_SIZE);
        let device = SimDevice::new().with_file("run.bin", contents.clone());
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick_engine());

        let file = engine
            .download_file(&descriptor("run.bin", contents.len()))
            .unwrap();

        assert_eq!(file.data, contents);
        assert_eq!(file.report.requested_chunks, 3);
        assert_eq!(file.report.shortfall, 0);
        assert_eq!(file.report.resumes, 0);
        assert_eq!(device.chunk_requests(), 3);
    }

    #[test]
    fn test_trailing_partial_chunk_not_requested() {
        let contents = pattern(7000);
        let device = SimDevice::new().with_file("B", contents.clone());
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick_engine());

        let file = engine.download_file(&descriptor("B", 7000)).unwrap();

        assert_eq!(file.data, contents[..CHUNK_SIZE]);
        assert_eq!(file.report.expected_bytes, 5120);
        assert_eq!(file.report.dropped_tail(), 1880);
        assert_eq!(device.chunk_requests(), 1);
    }

    #[test]
    fn test_file_smaller_than_chunk_downloads_nothing() {
        let device = SimDevice::new().with_file("tiny", pattern(100));
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick_engine());

        let file = engine.download_file(&descriptor("tiny", 100)).unwrap();
        assert!(file.data.is_empty());
        assert_eq!(file.report.requested_chunks, 0);
        assert_eq!(device.chunk_requests(), 0);
    }

    #[test]
    fn test_single_stall_resumes_once() {
        let contents = pattern(2 * CHUNK_SIZE);
        let device = SimDevice::new()
            .with_file("A", contents.clone())
            .stall_chunk(1, 1);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick_engine());

        let file = engine.download_file(&descriptor("A", contents.len())).unwrap();

        assert_eq!(file.data, contents);
        assert_eq!(file.report.resumes, 1);
        assert_eq!(device.chunk_requests(), 3);
        assert_eq!(
            device.resume_frames(),
            vec![ResumeFrame::for_chunk(1, CHUNK_SIZE).encode()]
        );

        let mut wire = vec![0xFF, 0xFE, 0xFD];
        wire.extend_from_slice(b"5120");
        wire.extend_from_slice(&[0xFD, 0xFE, 0xFF]);
        assert_eq!(device.resume_frames()[0], wire);
    }

    #[test]
    fn test_second_stall_on_same_chunk_fails() {
        let contents = pattern(2 * CHUNK_SIZE);
        let device = SimDevice::new()
            .with_file("A", contents.clone())
            .stall_chunk(0, 2);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick_engine());

        let result = engine.download_file(&descriptor("A", contents.len()));
        match result {
            Err(Error::ResumeFailed {
                chunk_index,
                offset,
                ..
            }) => {
                assert_eq!(chunk_index, 0);
                assert_eq!(offset, 0);
            },
            other => panic!("expected ResumeFailed, got {other:?}"),
        }
        assert_eq!(device.resume_frames().len(), 1);
    }

    #[test]
    fn test_mismatched_resume_echo_fails() {
        let contents = pattern(2 * CHUNK_SIZE);
        let device = SimDevice::new()
            .with_file("A", contents.clone())
            .stall_chunk(1, 1)
            .skew_resume_echo(1);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick_engine());

        let result = engine.download_file(&descriptor("A", contents.len()));
        assert!(matches!(
            result,
            Err(Error::ResumeFailed {
                chunk_index: 1,
                offset: 5120,
                ..
            })
        ));
        // The chunk is not retried after a mismatch
        assert_eq!(device.chunk_requests(), 2);
    }

    #[test]
    fn test_slow_chunk_within_stall_window_is_not_a_stall() {
        let contents = pattern(CHUNK_SIZE);
        let device = SimDevice::new()
            .with_file("slow", contents.clone())
            .trickle(512, Duration::from_millis(20));
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick_engine());

        // Ten pieces take ~180ms in total, longer than the stall window,
        // but no single gap exceeds it.
        let file = engine
            .download_file(&descriptor("slow", contents.len()))
            .unwrap();
        assert_eq!(file.data, contents);
        assert_eq!(file.report.resumes, 0);
        assert!(device.resume_frames().is_empty());
    }

    #[test]
    fn test_progress_and_state() {
        let contents = pattern(4 * 64);
        let device = SimDevice::new()
            .with_file("small", contents.clone())
            .with_chunk_size(64);
        let mut session = device.session();
        let mut engine = ProtocolEngine::with_config(&mut session, quick_engine());

        let config = TransferConfig {
            chunk_size: 64,
            ..TransferConfig::default()
        };
        let transfer = FileTransfer::new(&mut engine, &descriptor("small", 256), config);
        assert_eq!(transfer.state().phase, TransferPhase::Idle);

        let mut seen = Vec::new();
        let file = transfer.run(|done, total| seen.push((done, total))).unwrap();

        assert_eq!(file.data, contents);
        assert_eq!(seen, vec![(64, 256), (128, 256), (192, 256), (256, 256)]);
    }
}
