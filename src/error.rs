//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

/// All possible errors returned by esprom
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(esprom::slip_framing),
        help("Try resetting the device into the bootloader and try again")
    )]
    Framing(#[from] FramingError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Timeout while running {0}command")]
    #[diagnostic(
        code(esprom::timeout),
        help("The device stopped answering, if a flash write was in progress it has to be repeated")
    )]
    Timeout(TimedOutCommand),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esprom::connection_failed),
        help("Ensure that the device is connected and was reset with GPIO0 held low")
    )]
    Connection,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Layout(#[from] LayoutError),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esprom::serial_error))]
    Serial(#[source] io::Error),

    #[error("Supplied ELF image is not valid")]
    #[diagnostic(code(esprom::invalid_elf))]
    InvalidElf(#[from] ElfError),

    #[error("Invalid firmware image: {0}")]
    #[diagnostic(code(esprom::invalid_image))]
    InvalidImage(String),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(esprom::file_open))]
    FileOpen(String, #[source] io::Error),

    #[error("Failed to parse configuration file")]
    #[diagnostic(code(esprom::invalid_config))]
    InvalidConfig(#[from] toml::de::Error),
}

/// Coarse classification of an [Error], for callers which branch on the kind
/// of failure rather than its details
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Framing,
    Protocol,
    Timeout,
    Connection,
    Layout,
    Io,
    Elf,
    Image,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Framing(_) => ErrorKind::Framing,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Connection => ErrorKind::Connection,
            Error::Layout(_) => ErrorKind::Layout,
            Error::Serial(_) | Error::FileOpen(..) => ErrorKind::Io,
            Error::InvalidElf(_) => ErrorKind::Elf,
            Error::InvalidImage(_) => ErrorKind::Image,
            Error::InvalidConfig(_) => ErrorKind::Config,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::Timeout(TimedOutCommand::default())
            }
            _ => Self::Serial(err),
        }
    }
}

#[cfg(feature = "serialport")]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::from(io::Error::from(err))
    }
}

/// Malformed SLIP delimiter or escape sequence
#[derive(Clone, Copy, Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FramingError {
    #[error("Invalid head of packet: expected 0xc0, got {0:#04x}")]
    InvalidStart(u8),

    #[error("Invalid SLIP escape sequence: 0xdb followed by {0:#04x}")]
    InvalidEscape(u8),

    #[error("Invalid end of packet: expected 0xc0, got {0:#04x}")]
    InvalidEnd(u8),
}

/// A well-framed response which the bootloader should not have sent
#[derive(Clone, Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("The bootloader rejected the {command} command with status {status:#04x}")]
    #[diagnostic(code(esprom::protocol::status))]
    InvalidStatus { command: CommandType, status: u8 },

    #[error("Expected a response to the {expected} command, got opcode {received:#04x}")]
    #[diagnostic(code(esprom::protocol::opcode))]
    OpcodeMismatch { expected: CommandType, received: u8 },

    #[error("Invalid response body to the {command} command: {body:02x?}")]
    #[diagnostic(code(esprom::protocol::body))]
    UnexpectedBody { command: CommandType, body: Vec<u8> },
}

/// Section sets which cannot be laid out as an image
#[derive(Clone, Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LayoutError {
    #[error("The image has no statically mapped sections")]
    #[diagnostic(code(esprom::layout::no_static_sections))]
    NoStaticSections,

    #[error("Section at {address:#010x} overlaps the data ending at {end:#010x}")]
    #[diagnostic(code(esprom::layout::overlap))]
    Overlap { address: u32, end: u32 },

    #[error("Static image offset {offset:#x} lies within the {ram_len:#x} byte RAM image")]
    #[diagnostic(
        code(esprom::layout::combined_overlap),
        help("Write the RAM image and the static image separately")
    )]
    CombinedOverlap { offset: u32, ram_len: usize },

    #[error("{0} loaded sections do not fit the image header (at most 255)")]
    #[diagnostic(code(esprom::layout::too_many_sections))]
    TooManySections(usize),

    #[error("Region of {size:#x} bytes at {address:#010x} runs past the end of the address space")]
    #[diagnostic(code(esprom::layout::address_overflow))]
    AddressOverflow { address: u32, size: usize },
}

/// Invalid ELF file error
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ElfError(&'static str);

impl From<&'static str> for ElfError {
    fn from(err: &'static str) -> Self {
        ElfError(err)
    }
}

/// An executed command which has timed out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Timeout(_)) => Err(Error::Timeout(command.into())),
            res => res,
        }
    }
}
