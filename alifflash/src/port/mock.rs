//! In-memory connector for unit tests.
//!
//! Frames written to a [`MockPort`] are parsed and handed to a scripted
//! responder, whose [`Reply`] is queued as input for the next read. Every
//! write is recorded with the session (successful open) it happened on, and
//! pauses are recorded instead of slept.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    error::{Error, Result},
    port::{Connector, Port, PortInfo, SerialConfig},
    protocol::isp::{CommandId, checksum, encode, parse_frame},
};

/// What the simulated SE sends back for one frame.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ack,
    Data(Vec<u8>),
    Code(u8),
    Silent,
}

/// A frame the host wrote.
#[derive(Debug, Clone)]
pub(crate) struct Written {
    pub session: usize,
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Written {
    pub fn command(&self) -> Option<CommandId> {
        CommandId::from_code(self.code)
    }

    /// Sequence number of a DOWNLOAD_DATA frame.
    pub fn sequence(&self) -> Option<u16> {
        (self.command() == Some(CommandId::DownloadData))
            .then(|| u16::from_le_bytes([self.payload[0], self.payload[1]]))
    }
}

type Responder = Box<dyn FnMut(&Written) -> Reply + Send>;

struct State {
    responder: Responder,
    writes: Vec<Written>,
    rx: VecDeque<u8>,
    sessions: usize,
    open_attempts: usize,
    open_failures: usize,
    unplug_after: Option<usize>,
    stale_on_open: Vec<u8>,
    vanish_on_open: bool,
    port_lists: VecDeque<Vec<PortInfo>>,
    pauses: Vec<Duration>,
    live_session: Option<usize>,
}

#[derive(Clone)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<State>>,
}

impl MockConnector {
    pub fn new(responder: impl FnMut(&Written) -> Reply + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                responder: Box::new(responder),
                writes: Vec::new(),
                rx: VecDeque::new(),
                sessions: 0,
                open_attempts: 0,
                open_failures: 0,
                unplug_after: None,
                stale_on_open: Vec::new(),
                vanish_on_open: false,
                port_lists: VecDeque::new(),
                pauses: Vec::new(),
                live_session: None,
            })),
        }
    }

    /// Acknowledges every frame.
    pub fn acking() -> Self {
        Self::new(|_| Reply::Ack)
    }

    /// Never answers.
    pub fn silent() -> Self {
        Self::new(|_| Reply::Silent)
    }

    /// The next `count` opens fail.
    pub fn fail_opens(self, count: usize) -> Self {
        self.lock().open_failures = count;
        self
    }

    /// Opens fail once `sessions` opens have succeeded.
    pub fn unplug_after(self, sessions: usize) -> Self {
        self.lock().unplug_after = Some(sessions);
        self
    }

    /// Bytes waiting in the input buffer right after each open.
    pub fn stale_on_open(self, bytes: &[u8]) -> Self {
        self.lock().stale_on_open = bytes.to_vec();
        self
    }

    /// Ports open, then fail every I/O call as if unplugged right away.
    pub fn vanish_on_open(self) -> Self {
        self.lock().vanish_on_open = true;
        self
    }

    /// Successive results of `list_ports`; the last one repeats.
    pub fn with_port_lists(self, lists: Vec<Vec<PortInfo>>) -> Self {
        self.lock().port_lists = lists.into();
        self
    }

    /// Push raw bytes into the input buffer.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock()
            .rx
            .extend(bytes.iter().copied());
    }

    pub fn writes(&self) -> Vec<Written> {
        self.lock()
            .writes
            .clone()
    }

    pub fn commands(&self) -> Vec<CommandId> {
        self.writes()
            .iter()
            .filter_map(Written::command)
            .collect()
    }

    pub fn pauses(&self) -> Vec<Duration> {
        self.lock()
            .pauses
            .clone()
    }

    pub fn sessions(&self) -> usize {
        self.lock().sessions
    }

    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }

    /// Whether a port handed out by this connector is still open.
    pub fn is_port_open(&self) -> bool {
        self.lock()
            .live_session
            .is_some()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Frame with an arbitrary code and no payload, as a confused device would send.
fn raw_reply(code: u8) -> Vec<u8> {
    let mut frame = vec![3, code];
    frame.push(checksum(&frame));
    frame
}

impl Connector for MockConnector {
    type Port = MockPort;

    fn open(&self, config: &SerialConfig) -> Result<MockPort> {
        let mut state = self.lock();
        state.open_attempts += 1;

        let unplugged = state
            .unplug_after
            .is_some_and(|limit| state.sessions >= limit);
        if unplugged || state.open_failures > 0 {
            state.open_failures = state
                .open_failures
                .saturating_sub(1);
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not present", config.port_name),
            )));
        }

        state.sessions += 1;
        let session = state.sessions;
        state.live_session = Some(session);
        state
            .rx
            .clear();
        let stale = state
            .stale_on_open
            .clone();
        state
            .rx
            .extend(stale);

        Ok(MockPort {
            name: config
                .port_name
                .clone(),
            session,
            open: !state.vanish_on_open,
            state: Arc::clone(&self.state),
        })
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let mut state = self.lock();
        let ports = if state.port_lists.len() > 1 {
            state
                .port_lists
                .pop_front()
        } else {
            state
                .port_lists
                .front()
                .cloned()
        };
        Ok(ports.unwrap_or_default())
    }

    fn pause(&self, duration: Duration) {
        self.lock()
            .pauses
            .push(duration);
    }
}

pub(crate) struct MockPort {
    name: String,
    session: usize,
    open: bool,
    state: Arc<Mutex<State>>,
}

impl MockPort {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"))
        }
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let mut state = self.lock();
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf
            .len()
            .min(state.rx.len());
        for (slot, byte) in buf
            .iter_mut()
            .zip(state.rx.drain(..n))
        {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let session = self.session;
        let mut state = self.lock();

        let Some(frame) = parse_frame(buf) else {
            return Ok(buf.len());
        };
        let written = Written {
            session,
            code: frame.code,
            payload: frame.payload,
        };
        let reply = (state.responder)(&written);
        state
            .writes
            .push(written);

        let bytes = match reply {
            Reply::Ack => encode(CommandId::Ack, &[]).unwrap_or_default(),
            Reply::Data(payload) => encode(CommandId::DataResponse, &payload).unwrap_or_default(),
            Reply::Code(code) => raw_reply(code),
            Reply::Silent => Vec::new(),
        };
        state
            .rx
            .extend(bytes);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_open()
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        self.ensure_open()?;
        Ok(u32::try_from(
            self.lock()
                .rx
                .len(),
        )
        .unwrap_or(u32::MAX))
    }

    fn clear_input(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.lock()
            .rx
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        let mut state = self.lock();
        if state.live_session == Some(self.session) {
            state.live_session = None;
        }
        Ok(())
    }
}

impl Drop for MockPort {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A USB FTDI adapter as the host would enumerate it.
pub(crate) fn ftdi_port(name: &str) -> PortInfo {
    PortInfo {
        name: name.to_string(),
        vid: Some(0x0403),
        pid: Some(0x6001),
        manufacturer: Some("FTDI".to_string()),
        ..PortInfo::default()
    }
}
