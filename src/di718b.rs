//! Session handling for the DATAQ DI-718B-E(S) over TCP.
//!
//! The device takes `0x00`-prefixed ASCII commands, echoes each body back,
//! and once started streams rows of little-endian 16-bit words until it is
//! told to stop with the raw `\0T0` sequence.

use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::command::{send_command, write_error};
use crate::frame::{Calibration, DecodeError, decode_row};

pub const MAX_CHANNELS: usize = 32;
pub const DEFAULT_PORT: u16 = 10001;
pub const DEFAULT_SCAN_LIST: &str = "E000E001E002E003E004E005E006E007";
/// Most words a single block read may fetch.
pub const BUFFER_WORDS: usize = 512;
/// Halts streaming. Sent raw, the device does not echo it.
pub const STOP_STREAM: [u8; 3] = *b"\0T0";

const DRAIN_CHUNK: usize = 32;
/// Shortest time spent discarding, whatever the drain delay.
const MIN_DRAIN_WINDOW: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("requested {channels} channels, supported range is 1..={max}")]
    ConfigurationOutOfRange { channels: usize, max: usize },

    #[error("DNS lookup for {host} failed: {source}")]
    HostResolutionFailed { host: String, source: io::Error },

    #[error("error connecting to {addr}: {source}")]
    ConnectionRefused { addr: String, source: io::Error },

    #[error("socket setup error: {0}")]
    Socket(io::Error),

    #[error("{rows} rows of {channels} channels exceed {max} words per read")]
    ReadSizeOutOfRange { rows: usize, channels: usize, max: usize },

    #[error("command is {len} bytes, maximum is {max}")]
    CommandTooLong { len: usize, max: usize },

    #[error("error writing to socket: {0}")]
    WriteFailed(io::Error),

    #[error("error reading from socket: {0}")]
    ReadFailed(io::Error),

    #[error("timed out reading from socket")]
    ReadTimeout,

    #[error("connection closed by device")]
    PeerClosed,

    #[error("expected '{expected}', received '{received}'")]
    EchoMismatch { expected: String, received: String },

    #[error("expected {expected} bytes, read {actual} bytes")]
    ShortRead { expected: usize, actual: usize },

    #[error("{0}")]
    Decode(#[from] DecodeError),
}

/// Device parameters sent during initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Division from the 14400 Hz main timer.
    pub timer_scaler: u8,
    /// Further division of the output rate.
    pub rate_divisor: u16,
    /// Channel and gain codes, four hex digits per channel.
    pub scan_list: String,
    /// Number of leading scan list entries to sample.
    pub channel_count: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timer_scaler: 2,
            rate_divisor: 0,
            scan_list: DEFAULT_SCAN_LIST.to_string(),
            channel_count: 6,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(Error::ConfigurationOutOfRange {
                channels: self.channel_count,
                max: MAX_CHANNELS,
            });
        }
        Ok(())
    }

    pub fn row_bytes(&self) -> usize {
        2 * self.channel_count
    }

    /// Most rows a single block read may request.
    pub fn max_rows(&self) -> usize {
        BUFFER_WORDS / self.channel_count.max(1)
    }

    /// Byte length of a block of `rows` rows, bounded by [`BUFFER_WORDS`].
    pub fn block_bytes(&self, rows: usize) -> Result<usize, Error> {
        let out_of_range = || Error::ReadSizeOutOfRange {
            rows,
            channels: self.channel_count,
            max: BUFFER_WORDS,
        };
        let words = rows
            .checked_mul(self.channel_count)
            .ok_or_else(out_of_range)?;
        if words > BUFFER_WORDS {
            return Err(out_of_range());
        }
        Ok(2 * words)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Bound on every blocking receive.
    pub read_timeout: Duration,
    /// How long the device keeps sending after being stopped.
    pub drain_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            read_timeout: Duration::from_secs(1),
            drain_delay: Duration::from_micros(222_222),
        }
    }
}

/// Shared stop request, checked by blocking reads whenever they wake up.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    stop: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// How an attempt to fill a buffer ended.
#[derive(Debug)]
pub(crate) enum Fill {
    Complete,
    Eof(usize),
    TimedOut(usize),
    Failed(io::Error),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Filled {
    Complete,
    Cancelled,
}

impl Fill {
    pub(crate) fn finish(self, expected: usize) -> Result<Filled, Error> {
        match self {
            Fill::Complete => Ok(Filled::Complete),
            Fill::Cancelled => Ok(Filled::Cancelled),
            Fill::Eof(0) => Err(Error::PeerClosed),
            Fill::TimedOut(0) => Err(Error::ReadTimeout),
            Fill::Eof(actual) | Fill::TimedOut(actual) => Err(Error::ShortRead { expected, actual }),
            Fill::Failed(err) => Err(Error::ReadFailed(err)),
        }
    }
}

/// Read until `buf` is full, the peer closes, a receive times out or `cancel` is set.
pub(crate) fn fill<R: Read>(reader: &mut R, buf: &mut [u8], cancel: Option<&CancelToken>) -> Fill {
    let cancelled = || cancel.is_some_and(CancelToken::is_cancelled);

    let mut filled = 0;
    while filled < buf.len() {
        if cancelled() {
            return Fill::Cancelled;
        }
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Fill::Eof(filled),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if cancelled() {
                    return Fill::Cancelled;
                }
                return Fill::TimedOut(filled);
            }
            Err(err) => return Fill::Failed(err),
        }
    }
    Fill::Complete
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Flushing,
    Initializing,
    Streaming,
    Stopping,
    Closed,
}

/// Undecoded words of one or more rows, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    words: Vec<u16>,
    channel_count: usize,
}

impl RawBlock {
    pub fn from_le_bytes(bytes: &[u8], channel_count: usize) -> Self {
        let words = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        RawBlock {
            words,
            channel_count,
        }
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn row_count(&self) -> usize {
        self.words.len() / self.channel_count.max(1)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u16]> {
        self.words.chunks_exact(self.channel_count.max(1))
    }

    pub fn decode(&self, calibration: &Calibration) -> impl Iterator<Item = Result<Vec<f32>, DecodeError>> {
        let channel_count = self.channel_count;
        self.rows()
            .map(move |row| decode_row(row, channel_count, calibration))
    }
}

#[derive(Debug)]
pub enum ReadOutcome {
    Block(RawBlock),
    Cancelled,
}

/// A streaming connection to one device.
///
/// Dropping a session stops the stream the same way [`Session::close`] does.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    config: SessionConfig,
    timing: Timing,
    state: SessionState,
}

impl Session {
    pub fn connect(host: &str, port: u16, config: &SessionConfig) -> Result<Session, Error> {
        Self::connect_with_timing(host, port, config, Timing::default())
    }

    /// Connect, clear whatever a previous session left behind, configure
    /// the device and start streaming.
    pub fn connect_with_timing(
        host: &str,
        port: u16,
        config: &SessionConfig,
        timing: Timing,
    ) -> Result<Session, Error> {
        config.validate()?;

        let addrs = resolve(host, port)?;
        let stream = TcpStream::connect(&addrs[..]).map_err(|source| Error::ConnectionRefused {
            addr: format!("{}:{}", host, port),
            source,
        })?;
        stream
            .set_read_timeout(Some(timing.read_timeout))
            .map_err(Error::Socket)?;
        stream
            .set_write_timeout(Some(timing.read_timeout))
            .map_err(Error::Socket)?;
        log::info!("connected to {}:{}", host, port);

        let mut session = Session {
            stream,
            config: config.clone(),
            timing,
            state: SessionState::Connected,
        };
        session.flush()?;
        session.initialize()?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    fn set_state(&mut self, state: SessionState) {
        log::debug!("session {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    // Stop any stream left running by an unclean exit and discard its tail.
    fn flush(&mut self) -> Result<(), Error> {
        self.set_state(SessionState::Flushing);
        self.stream.write_all(&STOP_STREAM).map_err(write_error)?;
        let drained = self.drain().map_err(Error::Socket)?;
        if drained > 0 {
            log::debug!("discarded {} stale bytes", drained);
        }
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), Error> {
        self.set_state(SessionState::Initializing);
        let stream = &mut self.stream;
        let config = &self.config;
        send_command(stream, format_args!("X{:02X}", config.timer_scaler))?;
        send_command(stream, format_args!("M{:04X}", config.rate_divisor))?;
        send_command(stream, format_args!("L00{}", config.scan_list))?;
        send_command(stream, format_args!("C{:02X}", config.channel_count))?;
        send_command(stream, format_args!("S3"))?;
        self.set_state(SessionState::Streaming);
        Ok(())
    }

    // Discards for at most one drain window, even if the device keeps streaming.
    fn drain(&mut self) -> io::Result<usize> {
        thread::sleep(self.timing.drain_delay);
        self.stream.set_nonblocking(true)?;
        let deadline = Instant::now() + self.timing.drain_delay.max(MIN_DRAIN_WINDOW);
        let mut chunk = [0u8; DRAIN_CHUNK];
        let mut drained = 0;
        while Instant::now() < deadline {
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => drained += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.stream.set_nonblocking(false)?;
        Ok(drained)
    }

    /// Read `rows` complete rows.
    ///
    /// Returns [`ReadOutcome::Cancelled`] once `cancel` is set, at the latest
    /// one read timeout after it was raised. Bytes of an interrupted row are
    /// dropped. Requests above [`BUFFER_WORDS`] words fail before any I/O.
    pub fn read_block(&mut self, rows: usize, cancel: &CancelToken) -> Result<ReadOutcome, Error> {
        let mut bytes = vec![0u8; self.config.block_bytes(rows)?];
        match fill(&mut self.stream, &mut bytes, Some(cancel)).finish(bytes.len())? {
            Filled::Cancelled => Ok(ReadOutcome::Cancelled),
            Filled::Complete => Ok(ReadOutcome::Block(RawBlock::from_le_bytes(
                &bytes,
                self.config.channel_count,
            ))),
        }
    }

    /// Stop streaming and disconnect. Never fails.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if matches!(self.state, SessionState::Closed | SessionState::Disconnected) {
            return;
        }
        self.set_state(SessionState::Stopping);
        if let Err(err) = self.stream.write_all(&STOP_STREAM) {
            log::warn!("error stopping stream: {}", err);
        }
        match self.drain() {
            Ok(0) => {}
            Ok(drained) => log::debug!("discarded {} bytes after stop", drained),
            Err(err) => log::warn!("error flushing socket: {}", err),
        }
        // ignored, the peer may already be gone
        let _ = self.stream.shutdown(Shutdown::Both);
        self.set_state(SessionState::Closed);
        log::info!("disconnected");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::HostResolutionFailed {
            host: host.to_string(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(Error::HostResolutionFailed {
            host: host.to_string(),
            source: io::Error::new(ErrorKind::NotFound, "no addresses"),
        });
    }
    Ok(addrs)
}

/// Find a device on the local network.
///
/// Not implemented, prints where to look instead.
pub fn autodiscover() -> Option<String> {
    eprintln!(
        "Sorry, autodiscovery unimplemented.\n\
         If the network's DHCP server registers hostnames, try 'di718b' as the hostname.\n\
         Otherwise use the 'DATAQ Instruments Hardware Manager' utility provided with WinDAQ,\n\
         or check your DHCP logs for MAC addresses starting with 00:80:A3."
    );
    None
}
