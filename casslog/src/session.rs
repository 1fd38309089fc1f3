//! Device sessions and link role negotiation.
//!
//! The two links the logger exposes are indistinguishable until the host
//! writes the identify opcode to both: the firmware answers with
//! [`IDENTIFY_ACK`] on its command link only. Negotiation turns that answer
//! into a [`DeviceSession`] whose links are labeled by role, and fails closed
//! when the answer is missing or ambiguous.
//!
//! A session owns both links and closes them together when dropped, on every
//! exit path.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::opcode::{IDENTIFY_ACK, Opcode};
use log::{debug, info, trace, warn};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Default window for either link to answer the identify opcode.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Role of a link within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// Carries payload and responses from the device.
    Data,
    /// Carries opcodes to the device.
    Command,
}

/// Which of the two candidate links acknowledged the identify opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandLink {
    /// The first link passed to [`negotiate`].
    First,
    /// The second link passed to [`negotiate`].
    Second,
}

impl CommandLink {
    /// Classify the identify responses read from both links.
    pub fn from_responses(first: &[u8], second: &[u8]) -> Result<Self> {
        let acked = |resp: &[u8]| resp == [IDENTIFY_ACK];

        match (acked(first), acked(second)) {
            (true, false) => Ok(Self::First),
            (false, true) => Ok(Self::Second),
            (true, true) => Err(Error::ProtocolViolation(
                "both links acknowledged identify".into(),
            )),
            (false, false) => Err(Error::ProtocolViolation(format!(
                "no link acknowledged identify (responses {first:02X?} / {second:02X?})"
            ))),
        }
    }
}

/// Link negotiation settings.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Window for either link to answer.
    pub timeout: Duration,
    /// Sleep between polls while both links are silent.
    pub poll_interval: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout: HANDSHAKE_TIMEOUT,
            poll_interval: Duration::from_millis(1),
        }
    }
}

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Process-wide guard ensuring at most one open logger session.
#[derive(Debug)]
pub struct SessionLock(());

impl SessionLock {
    /// Take the lock, failing with [`Error::SessionActive`] if it is held.
    pub fn acquire() -> Result<Self> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::SessionActive)?;
        Ok(Self(()))
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::Release);
    }
}

/// The negotiated (Data, Command) link pair for one device conversation.
pub struct DeviceSession<P: Port> {
    data: P,
    command: P,
    // Declared last so the lock is released after both links are closed.
    lock: Option<SessionLock>,
}

impl<P: Port> DeviceSession<P> {
    /// Assemble a session from links whose roles are already known.
    pub fn new(data: P, command: P) -> Self {
        Self {
            data,
            command,
            lock: None,
        }
    }

    /// Attach the process-wide session lock.
    #[must_use]
    pub fn guarded_by(mut self, lock: SessionLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Whether this session holds the process-wide lock.
    pub fn is_exclusive(&self) -> bool {
        self.lock.is_some()
    }

    /// Borrow the link with the given role.
    pub fn link(&self, role: LinkRole) -> &P {
        match role {
            LinkRole::Data => &self.data,
            LinkRole::Command => &self.command,
        }
    }

    /// Mutably borrow the link with the given role.
    pub fn link_mut(&mut self, role: LinkRole) -> &mut P {
        match role {
            LinkRole::Data => &mut self.data,
            LinkRole::Command => &mut self.command,
        }
    }

    /// The Data link.
    pub fn data_mut(&mut self) -> &mut P {
        &mut self.data
    }

    /// The Command link.
    pub fn command_mut(&mut self) -> &mut P {
        &mut self.command
    }

    /// Drop pending input on both links and push out pending output.
    pub fn flush_all(&mut self) -> Result<()> {
        for link in [&mut self.data, &mut self.command] {
            link.clear_input()?;
            Write::flush(link)?;
        }
        Ok(())
    }

    /// Close both links.
    pub fn close(mut self) -> Result<()> {
        self.close_links()
    }

    fn close_links(&mut self) -> Result<()> {
        // Both closes run even if the first fails
        let data = self.data.close();
        let command = self.command.close();
        data.and(command)
    }
}

impl<P: Port> Drop for DeviceSession<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close_links() {
            warn!("Failed to close logger links: {e}");
        }
    }
}

/// Assign roles to two freshly opened links.
///
/// Writes the identify opcode to both, then polls until either link has
/// data or `config.timeout` expires.
pub fn negotiate<P: Port>(
    mut first: P,
    mut second: P,
    config: &NegotiationConfig,
) -> Result<DeviceSession<P>> {
    debug!(
        "Negotiating roles for {} and {} at {} baud",
        first.name(),
        second.name(),
        first.baud_rate()
    );

    first.clear_buffers()?;
    second.clear_buffers()?;

    first.write_all_bytes(&[Opcode::Identify.byte()])?;
    second.write_all_bytes(&[Opcode::Identify.byte()])?;

    let start = Instant::now();
    while first.bytes_to_read()? == 0 && second.bytes_to_read()? == 0 {
        if start.elapsed() >= config.timeout {
            return Err(Error::HandshakeTimeout {
                timeout: config.timeout,
            });
        }
        thread::sleep(config.poll_interval);
    }

    let first_response = first.read_available(usize::MAX)?;
    let second_response = second.read_available(usize::MAX)?;
    trace!("Identify responses: {first_response:02X?} / {second_response:02X?}");

    let (data, command) = match CommandLink::from_responses(&first_response, &second_response)? {
        CommandLink::First => (second, first),
        CommandLink::Second => (first, second),
    };

    info!(
        "Logger links: command={} data={}",
        command.name(),
        data.name()
    );

    let mut session = DeviceSession::new(data, command);
    session.flush_all()?;
    Ok(session)
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{DeviceSession, Result, SessionLock, info, negotiate};
    use crate::config::DriverConfig;
    use crate::device::find_logger_ports;
    use crate::port::SerialConfig;
    use crate::port::native::NativePort;

    /// Discover, open and negotiate the logger's links.
    ///
    /// The returned session holds the process-wide [`SessionLock`]; a second
    /// call while it is alive fails with [`crate::Error::SessionActive`].
    pub fn connect(config: &DriverConfig) -> Result<DeviceSession<NativePort>> {
        let lock = SessionLock::acquire()?;

        let [a, b] = find_logger_ports(&config.port.name_pattern)?;
        let first = NativePort::open(&SerialConfig::new(a.name, config.port.baud))?;
        let second = NativePort::open(&SerialConfig::new(b.name, config.port.baud))?;

        let session = negotiate(first, second, &config.negotiation())?;
        info!("Logger session established");
        Ok(session.guarded_by(lock))
    }
}

#[cfg(feature = "native")]
pub use native_impl::connect;
