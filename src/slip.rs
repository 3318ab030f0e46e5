//! SLIP framing of bootloader packets
//!
//! Every packet is delimited by [END] bytes. Inside a packet, a literal `0xC0`
//! is sent as `0xDB 0xDC` and a literal `0xDB` as `0xDB 0xDD`. Responses are
//! decoded by length rather than by scanning for the closing delimiter, since
//! the response header announces the body length up front.

use std::io::{Read, Write};

use crate::error::{Error, FramingError};

/// SLIP end of packet token
pub const END: u8 = 0xC0;
/// SLIP escape token
pub const ESC: u8 = 0xDB;
/// SLIP escaped 0xC0 token
pub const ESC_END: u8 = 0xDC;
/// SLIP escaped 0xDB token
pub const ESC_ESC: u8 = 0xDD;

/// Streaming encoder which writes one framed packet to the inner writer
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    /// Creates a new encoder context, emitting the opening delimiter
    pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
        writer.write_all(&[END])?;
        Ok(Self { writer, len: 1 })
    }

    /// Emits the closing delimiter, returning the number of bytes written to
    /// the inner writer for the whole packet
    pub fn finish(self) -> std::io::Result<usize> {
        self.writer.write_all(&[END])?;
        Ok(self.len + 1)
    }
}

impl<W: Write> Write for SlipEncoder<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => {
                    self.writer.write_all(&[ESC, ESC_END])?;
                    self.len += 2;
                }
                ESC => {
                    self.writer.write_all(&[ESC, ESC_ESC])?;
                    self.len += 2;
                }
                _ => {
                    self.writer.write_all(&[*value])?;
                    self.len += 1;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Frame a complete payload
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 2);
    // writing into a Vec cannot fail
    let _ = SlipEncoder::new(&mut packet).and_then(|mut encoder| {
        encoder.write_all(payload)?;
        encoder.finish()
    });
    packet
}

/// Length-driven decoder for a single incoming packet
///
/// A packet is consumed with [SlipDecoder::begin], any number of
/// [SlipDecoder::read] calls, and [SlipDecoder::end].
pub struct SlipDecoder<'a, R: Read> {
    reader: &'a mut R,
}

impl<'a, R: Read> SlipDecoder<'a, R> {
    pub fn new(reader: &'a mut R) -> Self {
        Self { reader }
    }

    /// Consume the opening delimiter
    pub fn begin(&mut self) -> Result<(), Error> {
        match self.read_raw()? {
            END => Ok(()),
            other => Err(FramingError::InvalidStart(other).into()),
        }
    }

    /// Read exactly `len` unescaped bytes
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let byte = match self.read_raw()? {
                ESC => match self.read_raw()? {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    other => return Err(FramingError::InvalidEscape(other).into()),
                },
                byte => byte,
            };
            data.push(byte);
        }

        Ok(data)
    }

    /// Consume the closing delimiter
    pub fn end(&mut self) -> Result<(), Error> {
        match self.read_raw()? {
            END => Ok(()),
            other => Err(FramingError::InvalidEnd(other).into()),
        }
    }

    fn read_raw(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8];
        self.reader.read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

/// Read one fully framed packet carrying exactly `len` payload bytes
pub fn decode_stream<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, Error> {
    let mut decoder = SlipDecoder::new(reader);
    decoder.begin()?;
    let data = decoder.read(len)?;
    decoder.end()?;
    Ok(data)
}
