use std::{
    fmt,
    io::{ErrorKind, Read, Write},
};

use crate::di718b::{Error, fill};

/// Every outgoing command starts with this byte; the echo does not.
pub const COMMAND_MARKER: u8 = 0x00;

/// Longest command body the device accepts.
pub const MAX_COMMAND_LEN: usize = 255;

/// A formatted command body, at most `MAX_COMMAND_LEN` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuffer {
    body: String,
}

impl CommandBuffer {
    pub fn format(args: fmt::Arguments<'_>) -> Result<Self, Error> {
        let body = fmt::format(args);
        if body.len() > MAX_COMMAND_LEN {
            return Err(Error::CommandTooLong {
                len: body.len(),
                max: MAX_COMMAND_LEN,
            });
        }
        Ok(CommandBuffer { body })
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Bytes as they go out on the wire.
    pub fn frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + self.body.len());
        frame.push(COMMAND_MARKER);
        frame.extend_from_slice(self.body.as_bytes());
        frame
    }
}

pub(crate) fn write_error(err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::WriteZero {
        Error::PeerClosed
    } else {
        Error::WriteFailed(err)
    }
}

/// Send a command and wait for the device to echo its body back verbatim.
///
/// ```no_run
/// # use dataq_stream::command::send_command;
/// # fn f(stream: &mut std::net::TcpStream) -> Result<(), dataq_stream::Error> {
/// send_command(stream, format_args!("C{:02X}", 6))?;
/// # Ok(())
/// # }
/// ```
pub fn send_command<S: Read + Write>(stream: &mut S, args: fmt::Arguments<'_>) -> Result<(), Error> {
    let command = CommandBuffer::format(args)?;
    exchange(stream, &command)
}

pub fn exchange<S: Read + Write>(stream: &mut S, command: &CommandBuffer) -> Result<(), Error> {
    stream.write_all(&command.frame()).map_err(write_error)?;
    stream.flush().map_err(write_error)?;

    let expected = command.body().as_bytes();
    let mut echo = vec![0u8; expected.len()];
    fill(stream, &mut echo, None).finish(expected.len())?;

    if echo != expected {
        return Err(Error::EchoMismatch {
            expected: command.body().to_string(),
            received: String::from_utf8_lossy(&echo).into_owned(),
        });
    }

    log::debug!("CMD: {}", command.body());
    Ok(())
}
