//! Scripted in-memory [Port] for protocol tests

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    time::Duration,
};

use super::Port;
use crate::{error::Error, slip};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

/// Answers every complete request frame written to it with the raw bytes
/// produced by a responder, and times out when nothing is queued
pub(crate) struct TestPort {
    responder: Responder,
    input: VecDeque<u8>,
    frame: Option<Vec<u8>>,
    requests: Vec<Vec<u8>>,
    timeout: Duration,
    timeout_history: Vec<Duration>,
    clears: usize,
}

impl TestPort {
    pub(crate) fn new(responder: impl FnMut(&[u8]) -> Vec<u8> + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            input: VecDeque::new(),
            frame: None,
            requests: Vec::new(),
            timeout: Duration::from_secs(1),
            timeout_history: Vec::new(),
            clears: 0,
        }
    }

    /// A device which never answers
    pub(crate) fn silent() -> Self {
        Self::new(|_: &[u8]| Vec::new())
    }

    /// A device which accepts every command with an empty status body
    pub(crate) fn accepting() -> Self {
        Self::new(|request: &[u8]| response(request[1], 0, &[0, 0]))
    }

    /// Decoded request packets, in the order they were written
    pub(crate) fn requests(&self) -> &[Vec<u8>] {
        &self.requests
    }

    /// Every timeout set on the port, in order
    pub(crate) fn timeout_history(&self) -> &[Duration] {
        &self.timeout_history
    }

    pub(crate) fn clears(&self) -> usize {
        self.clears
    }

    fn receive(&mut self, byte: u8) {
        match (self.frame.take(), byte) {
            (None, slip::END) => self.frame = Some(Vec::new()),
            (None, _) => {}
            (Some(frame), slip::END) => {
                let packet = unescape(&frame);
                let reply = (self.responder)(&packet);
                self.requests.push(packet);
                self.input.extend(reply);
            }
            (Some(mut frame), byte) => {
                frame.push(byte);
                self.frame = Some(frame);
            }
        }
    }
}

impl Read for TestPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }

        let n = buf.len().min(self.input.len());
        for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for TestPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.receive(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for TestPort {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.timeout = timeout;
        self.timeout_history.push(timeout);
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<(), Error> {
        self.input.clear();
        self.clears += 1;
        Ok(())
    }
}

fn unescape(frame: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(frame.len());
    let mut bytes = frame.iter();
    while let Some(&byte) = bytes.next() {
        if byte == slip::ESC {
            match bytes.next() {
                Some(&slip::ESC_END) => packet.push(slip::END),
                Some(&slip::ESC_ESC) => packet.push(slip::ESC),
                other => panic!("invalid escape in request: {other:?}"),
            }
        } else {
            packet.push(byte);
        }
    }
    packet
}

/// A framed success response
pub(crate) fn response(op: u8, value: u32, body: &[u8]) -> Vec<u8> {
    raw_response(0x01, op, value, body)
}

/// A framed response carrying a failure status
pub(crate) fn error_response(op: u8, status: u8) -> Vec<u8> {
    raw_response(status, op, 0, &[0, 0])
}

/// The replies the ROM sends to one sync request
pub(crate) fn sync_responses() -> Vec<u8> {
    (0..8).flat_map(|_| response(0x08, 0, &[0, 0])).collect()
}

fn raw_response(status: u8, op: u8, value: u32, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![status, op];
    packet.extend_from_slice(&(body.len() as u16).to_le_bytes());
    packet.extend_from_slice(&value.to_le_bytes());
    packet.extend_from_slice(body);
    slip::encode(&packet)
}
