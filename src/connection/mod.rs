//! Establish a connection with a target device
//!
//! The [Connection] struct abstracts over the serial connection and
//! sending/decoding of commands, and provides the handshake which has to
//! succeed before any other command is issued.

use std::{
    io::{BufWriter, Read, Write},
    ops::{Deref, DerefMut},
    thread::sleep,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    command::{BodyCheck, Command, CommandType},
    error::{Error, ProtocolError, ResultExt},
    slip::{SlipDecoder, SlipEncoder},
};

#[cfg(test)]
pub(crate) mod test_port;

const MAX_CONNECT_ATTEMPTS: usize = 10;
/// The ROM answers a single sync request several times
const SYNC_ECHOES: usize = 7;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const RETRY_DELAY: Duration = Duration::from_millis(100);
/// Timeout used once a connection has been established
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const RESPONSE_HEADER_LEN: usize = 8;
const STATUS_SUCCESS: u8 = 0x01;

/// Byte transport to the bootloader
///
/// Reads are expected to fail with [std::io::ErrorKind::TimedOut] once the
/// configured timeout elapses without data.
pub trait Port: Read + Write {
    /// Current read timeout
    fn timeout(&self) -> Duration;

    /// Set the read timeout
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Discard any buffered input and output
    fn clear_buffers(&mut self) -> Result<(), Error>;
}

#[cfg(feature = "serialport")]
impl Port for Box<dyn serialport::SerialPort> {
    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        (**self).set_timeout(timeout)?;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<(), Error> {
        (**self).clear(serialport::ClearBuffer::All)?;
        Ok(())
    }
}

/// A response from a target device following a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: u8,
    pub return_op: u8,
    pub value: u32,
    pub body: Vec<u8>,
}

/// An established connection with a target device
pub struct Connection<P: Port> {
    port: P,
}

impl<P: Port> Connection<P> {
    pub fn new(port: P) -> Self {
        Connection { port }
    }

    /// Try connecting repeatedly until the device answers, or give up
    ///
    /// Any failure during an attempt is swallowed and retried after a short
    /// pause. This is the only place where commands are retried.
    pub fn connect(&mut self) -> Result<(), Error> {
        self.port.set_timeout(CONNECT_TIMEOUT)?;

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match self.connect_attempt() {
                Ok(()) => {
                    self.port.set_timeout(DEFAULT_TIMEOUT)?;
                    info!("Connected after {} attempt(s)", attempt);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Connection attempt {} failed: {}", attempt, e);
                    sleep(RETRY_DELAY);
                }
            }
        }

        Err(Error::Connection)
    }

    fn connect_attempt(&mut self) -> Result<(), Error> {
        self.port.clear_buffers()?;
        self.sync()
    }

    /// Perform a connection test
    fn sync(&mut self) -> Result<(), Error> {
        self.command(Command::Sync)?;

        for _ in 0..SYNC_ECHOES {
            self.read_response(None)?;
        }

        Ok(())
    }

    /// Current read timeout of the transport
    pub fn timeout(&self) -> Duration {
        self.port.timeout()
    }

    /// Set timeout for the transport
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout)
    }

    /// Use `timeout` until the returned guard is dropped
    ///
    /// The previous timeout is restored when the guard goes out of scope, on
    /// success and error paths alike.
    pub fn timeout_guard(&mut self, timeout: Duration) -> Result<TimeoutGuard<'_, P>, Error> {
        let previous = self.port.timeout();
        self.port.set_timeout(timeout)?;

        Ok(TimeoutGuard {
            connection: self,
            previous,
        })
    }

    /// Write a command to the transport
    pub fn write_command(&mut self, command: &Command) -> Result<(), Error> {
        debug!(
            "Writing {} command ({} byte payload)",
            command.command_type(),
            command.payload_len()
        );

        let mut writer = BufWriter::new(&mut self.port);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;

        Ok(())
    }

    /// Read one response packet
    ///
    /// When `expected` is given, the echoed opcode has to match it.
    pub fn read_response(
        &mut self,
        expected: Option<CommandType>,
    ) -> Result<CommandResponse, Error> {
        let mut decoder = SlipDecoder::new(&mut self.port);
        decoder.begin()?;
        let header = decoder.read(RESPONSE_HEADER_LEN)?;
        let length = u16::from_le_bytes([header[2], header[3]]);
        let body = decoder.read(length as usize)?;
        decoder.end()?;

        let response = CommandResponse {
            status: header[0],
            return_op: header[1],
            value: u32::from_le_bytes([header[4], header[5], header[6], header[7]]),
            body,
        };

        if response.status != STATUS_SUCCESS {
            return Err(ProtocolError::InvalidStatus {
                command: expected.unwrap_or(CommandType::Unknown),
                status: response.status,
            }
            .into());
        }

        if let Some(expected) = expected {
            if response.return_op != expected as u8 {
                return Err(ProtocolError::OpcodeMismatch {
                    expected,
                    received: response.return_op,
                }
                .into());
            }
        }

        Ok(response)
    }

    /// Write a command and read its response
    pub fn command(&mut self, command: Command) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(&command).for_command(ty)?;
        self.read_response(Some(ty)).for_command(ty)
    }

    /// Write a command whose response body has to match the shape of its
    /// command type, returning the response value
    pub fn simple_command(&mut self, command: Command) -> Result<u32, Error> {
        let ty = command.command_type();
        let response = self.command(command)?;

        match ty.response_shape().check(&response.body) {
            BodyCheck::Accepted => Ok(response.value),
            BodyCheck::UnexpectedBody(body) => {
                Err(ProtocolError::UnexpectedBody { command: ty, body }.into())
            }
        }
    }

    /// Read a register
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        self.simple_command(Command::ReadReg { address })
    }

    /// Write a register, only touching the bits set in `mask`
    pub fn write_reg(
        &mut self,
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    ) -> Result<(), Error> {
        self.simple_command(Command::WriteReg {
            address,
            value,
            mask,
            delay_us,
        })?;

        Ok(())
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }
}

/// Temporarily overridden transport timeout, see [Connection::timeout_guard]
pub struct TimeoutGuard<'a, P: Port> {
    connection: &'a mut Connection<P>,
    previous: Duration,
}

impl<P: Port> Deref for TimeoutGuard<'_, P> {
    type Target = Connection<P>;

    fn deref(&self) -> &Self::Target {
        self.connection
    }
}

impl<P: Port> DerefMut for TimeoutGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
    }
}

impl<P: Port> Drop for TimeoutGuard<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.connection.port.set_timeout(self.previous) {
            warn!("Failed to restore timeout of {:?}: {}", self.previous, e);
        }
    }
}
