//! Commands understood by the ROM bootloader

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::checksum::{checksum, CHECKSUM_INIT};

/// Maximum block size for RAM writes
pub const RAM_BLOCK_SIZE: usize = 0x1800;
/// Maximum block size for flash writes
pub const FLASH_BLOCK_SIZE: usize = 0x400;

/// Block count and block size announced by every flash begin request
const FLASH_BEGIN_BLOCKS: u32 = 0x200;
const FLASH_BEGIN_BLOCK_SIZE: u32 = FLASH_BLOCK_SIZE as u32;

/// Flash begin erases the target region before answering
const ERASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a successful response
pub const STATUS_OK_BODY: [u8; 2] = [0x00, 0x00];
/// Alternate body some ROM revisions send in reply to flash end
pub const FLASH_END_ALT_BODY: [u8; 2] = [0x01, 0x06];

const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
];

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum CommandType {
    /// Placeholder for a response read without a preceding request
    Unknown = 0,
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0a,
}

impl CommandType {
    /// Timeout this command needs instead of the connection's current one
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            CommandType::FlashBegin => Some(ERASE_TIMEOUT),
            _ => None,
        }
    }

    /// Response body this command is expected to produce
    pub fn response_shape(&self) -> ResponseShape {
        match self {
            CommandType::FlashEnd => ResponseShape::FlashEnd,
            _ => ResponseShape::StatusOnly,
        }
    }
}

/// Shapes of response body the bootloader sends back
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseShape {
    /// Exactly [STATUS_OK_BODY]
    StatusOnly,
    /// [STATUS_OK_BODY] or [FLASH_END_ALT_BODY]
    FlashEnd,
}

/// Outcome of checking a response body against a [ResponseShape]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyCheck {
    Accepted,
    UnexpectedBody(Vec<u8>),
}

impl ResponseShape {
    pub fn check(&self, body: &[u8]) -> BodyCheck {
        let accepted = match self {
            ResponseShape::StatusOnly => body == STATUS_OK_BODY,
            ResponseShape::FlashEnd => body == STATUS_OK_BODY || body == FLASH_END_ALT_BODY,
        };

        if accepted {
            BodyCheck::Accepted
        } else {
            BodyCheck::UnexpectedBody(body.to_vec())
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    MemEnd {
        entry: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    },
    ReadReg {
        address: u32,
    },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
        }
    }

    /// Write the unframed request: header followed by the payload
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin { size, offset } => {
                begin_command(
                    writer,
                    size,
                    FLASH_BEGIN_BLOCKS,
                    FLASH_BEGIN_BLOCK_SIZE,
                    offset,
                )?;
            }
            Command::FlashData { data, sequence } | Command::MemData { data, sequence } => {
                data_command(writer, data, sequence)?;
            }
            Command::FlashEnd { reboot } => {
                // 1 keeps the device in the bootloader
                let stay = u32::from(!reboot);
                write_basic(writer, &stay.to_le_bytes(), 0)?;
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset)?;
            }
            Command::MemEnd { entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: u32::from(entry == 0),
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(writer, &SYNC_FRAME, 0)?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
                delay_us,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    addr: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    addr: address,
                    value,
                    mask,
                    delay_us,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
        }
        Ok(())
    }

    /// Size of the payload following the 8 byte request header
    pub fn payload_len(&self) -> usize {
        match self {
            Command::FlashData { data, .. } | Command::MemData { data, .. } => {
                size_of::<BlockParams>() + data.len()
            }
            Command::FlashBegin { .. } | Command::MemBegin { .. } => size_of::<BeginParams>(),
            Command::FlashEnd { .. } | Command::ReadReg { .. } => size_of::<u32>(),
            Command::MemEnd { .. } => 2 * size_of::<u32>(),
            Command::Sync => SYNC_FRAME.len(),
            Command::WriteReg { .. } => 4 * size_of::<u32>(),
        }
    }
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct BeginParams {
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct BlockParams {
    size: u32,
    sequence: u32,
    dummy1: u32,
    dummy2: u32,
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    let length = u16::try_from(data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "command payload too large")
    })?;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
) -> std::io::Result<()> {
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
    };
    write_basic(writer, bytes_of(&params), 0)
}

fn data_command<W: Write>(mut writer: W, data: &[u8], sequence: u32) -> std::io::Result<()> {
    let params = BlockParams {
        size: data.len() as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let length = u16::try_from(size_of::<BlockParams>() + data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "data block too large")
    })?;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&u32::from(checksum(data, CHECKSUM_INIT)).to_le_bytes())?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(data)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(command: Command) -> Vec<u8> {
        let mut out = Vec::new();
        command.write(&mut out).unwrap();
        assert_eq!(out.len(), 8 + command.payload_len());
        out
    }

    #[test]
    fn read_reg_request() {
        assert_eq!(
            request(Command::ReadReg {
                address: 0x6000_0078
            }),
            [0x00, 0x0a, 0x04, 0x00, 0, 0, 0, 0, 0x78, 0x00, 0x00, 0x60]
        );
    }

    #[test]
    fn write_reg_request() {
        let out = request(Command::WriteReg {
            address: 0x1000,
            value: 0xAABB_CCDD,
            mask: 0xFFFF_FFFF,
            delay_us: 5,
        });

        assert_eq!(&out[..4], [0x00, 0x09, 16, 0]);
        assert_eq!(&out[8..12], 0x1000u32.to_le_bytes());
        assert_eq!(&out[12..16], 0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(&out[16..20], 0xFFFF_FFFFu32.to_le_bytes());
        assert_eq!(&out[20..24], 5u32.to_le_bytes());
    }

    #[test]
    fn sync_request() {
        let out = request(Command::Sync);

        assert_eq!(&out[..8], [0x00, 0x08, 36, 0, 0, 0, 0, 0]);
        assert_eq!(&out[8..12], [0x07, 0x07, 0x12, 0x20]);
        assert!(out[12..].iter().all(|&b| b == 0x55));
        assert_eq!(out[12..].len(), 32);
    }

    #[test]
    fn flash_begin_uses_fixed_geometry() {
        let out = request(Command::FlashBegin {
            size: 0x2345,
            offset: 0x1000,
        });

        assert_eq!(&out[..2], [0x00, 0x02]);
        assert_eq!(&out[8..12], 0x2345u32.to_le_bytes());
        assert_eq!(&out[12..16], 0x200u32.to_le_bytes());
        assert_eq!(&out[16..20], 0x400u32.to_le_bytes());
        assert_eq!(&out[20..24], 0x1000u32.to_le_bytes());
    }

    #[test]
    fn data_blocks_carry_their_checksum() {
        let data = [0x01, 0x02, 0x03, 0xC0];
        let out = request(Command::FlashData {
            data: &data,
            sequence: 7,
        });

        assert_eq!(&out[..4], [0x00, 0x03, 20, 0]);
        let expected = u32::from(checksum(&data, CHECKSUM_INIT));
        assert_eq!(&out[4..8], expected.to_le_bytes());
        assert_eq!(&out[8..12], 4u32.to_le_bytes());
        assert_eq!(&out[12..16], 7u32.to_le_bytes());
        assert_eq!(&out[16..24], [0; 8]);
        assert_eq!(&out[24..], data);

        let out = request(Command::MemData {
            data: &data,
            sequence: 0,
        });
        assert_eq!(out[1], 0x07);
    }

    #[test]
    fn mem_end_flags_missing_entry() {
        let out = request(Command::MemEnd { entry: 0 });
        assert_eq!(&out[8..], [1, 0, 0, 0, 0, 0, 0, 0]);

        let out = request(Command::MemEnd {
            entry: 0x4010_0004,
        });
        assert_eq!(&out[8..12], 0u32.to_le_bytes());
        assert_eq!(&out[12..16], 0x4010_0004u32.to_le_bytes());
    }

    #[test]
    fn flash_end_stays_in_bootloader_unless_rebooting() {
        assert_eq!(&request(Command::FlashEnd { reboot: false })[8..], [1, 0, 0, 0]);
        assert_eq!(&request(Command::FlashEnd { reboot: true })[8..], [0, 0, 0, 0]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let data = vec![0u8; 0x10000];
        let mut out = Vec::new();
        let err = Command::MemData {
            data: &data,
            sequence: 0,
        }
        .write(&mut out)
        .unwrap_err();

        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn response_shapes() {
        let status_only = CommandType::ReadReg.response_shape();
        assert_eq!(status_only.check(&[0, 0]), BodyCheck::Accepted);
        assert_eq!(
            status_only.check(&[1, 6]),
            BodyCheck::UnexpectedBody(vec![1, 6])
        );

        let flash_end = CommandType::FlashEnd.response_shape();
        assert_eq!(flash_end.check(&[0, 0]), BodyCheck::Accepted);
        assert_eq!(flash_end.check(&[1, 6]), BodyCheck::Accepted);
        assert_eq!(flash_end.check(&[]), BodyCheck::UnexpectedBody(vec![]));
    }
}
