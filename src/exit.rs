use std::{fmt, io};

use dataq_stream::Error;

// sysexits.h
pub const OK: i32 = 0;
pub const USAGE: i32 = 64;
pub const DATA_ERR: i32 = 65;
pub const NO_HOST: i32 = 68;
pub const UNAVAILABLE: i32 = 69;
pub const SOFTWARE: i32 = 70;
pub const OS_ERR: i32 = 71;
pub const IO_ERR: i32 = 74;
pub const TEMP_FAIL: i32 = 75;
pub const PROTOCOL: i32 = 76;
pub const CONFIG: i32 = 78;

// failures sysexits.h has no name for
pub const WRITE_FAILED: i32 = 80;
pub const READ_FAILED: i32 = 81;
pub const PEER_CLOSED: i32 = 82;
pub const SHORT_READ: i32 = 83;
pub const SYNC_LOST: i32 = 84;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    CliError::new(IO_ERR, format!("{context}: {err}"))
}

/// Exit status of each error kind, one code per kind.
pub fn error_code(err: &Error) -> i32 {
    match err {
        Error::ConfigurationOutOfRange { .. } => CONFIG,
        Error::ReadSizeOutOfRange { .. } => DATA_ERR,
        Error::CommandTooLong { .. } => SOFTWARE,
        Error::HostResolutionFailed { .. } => NO_HOST,
        Error::ConnectionRefused { .. } => UNAVAILABLE,
        Error::Socket(_) => OS_ERR,
        Error::WriteFailed(_) => WRITE_FAILED,
        Error::ReadFailed(_) => READ_FAILED,
        Error::ReadTimeout => TEMP_FAIL,
        Error::PeerClosed => PEER_CLOSED,
        Error::EchoMismatch { .. } => PROTOCOL,
        Error::ShortRead { .. } => SHORT_READ,
        Error::Decode(_) => SYNC_LOST,
    }
}

pub fn protocol_error(context: &str, err: Error) -> CliError {
    let code = error_code(&err);
    let hint = match &err {
        Error::HostResolutionFailed { .. } => ", is it plugged in?",
        Error::ConnectionRefused { source, .. } if source.kind() == io::ErrorKind::HostUnreachable => {
            ", is it plugged in?"
        }
        Error::ConnectionRefused { .. } => ", is someone else using it?",
        _ => "",
    };
    CliError::new(code, format!("{context}: {err}{hint}"))
}
