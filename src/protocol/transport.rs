use std::io::{self, Read, Write};

use log::trace;
use rand::Rng;
use thiserror::Error;

use super::{HEADER_SIZE, MAX_MESSAGE_SIZE, Reply, WireMessage, opcode};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Frame(String),
}

/// The fixed 16 byte prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub opcode: i32,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        out[12..16].copy_from_slice(&self.opcode.to_le_bytes());
        out
    }

    /// Number of body bytes following the header.
    fn body_len(&self) -> Result<usize, TransportError> {
        usize::try_from(self.length)
            .ok()
            .filter(|len| (HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(len))
            .map(|len| len - HEADER_SIZE)
            .ok_or_else(|| TransportError::Frame(format!("invalid frame length {}", self.length)))
    }
}

impl From<[u8; HEADER_SIZE]> for FrameHeader {
    fn from(value: [u8; HEADER_SIZE]) -> Self {
        let read = |at: usize| i32::from_le_bytes([value[at], value[at + 1], value[at + 2], value[at + 3]]);
        Self {
            length: read(0),
            request_id: read(4),
            response_to: read(8),
            opcode: read(12),
        }
    }
}

/// Frame-level reads and writes over a bidirectional byte stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Writes every frame of `message`.
    pub fn write_message(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        trace!(
            "writing {} bytes for request {}",
            message.as_bytes().len(),
            message.request_id()
        );
        self.stream.write_all(message.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads the reply to `request_id` and returns its body.
    ///
    /// # Errors
    ///
    /// A reply answering another request or carrying another opcode leaves the stream
    /// out of sync and is reported as [`TransportError::Frame`].
    pub fn read_reply(&mut self, request_id: i32) -> Result<Vec<u8>, TransportError> {
        let (header, body) = self.read_frame()?;
        if header.response_to != request_id {
            return Err(TransportError::Frame(format!(
                "reply answers request {} but {request_id} was expected",
                header.response_to
            )));
        }
        if header.opcode != opcode::REPLY {
            return Err(TransportError::Frame(format!(
                "expected reply opcode {} but got {}",
                opcode::REPLY,
                header.opcode
            )));
        }
        Ok(body)
    }

    /// Reads one complete frame of any kind.
    pub fn read_frame(&mut self) -> Result<(FrameHeader, Vec<u8>), TransportError> {
        let mut raw = [0; HEADER_SIZE];
        self.stream.read_exact(&mut raw)?;
        let header = FrameHeader::from(raw);

        let mut body = vec![0; header.body_len()?];
        self.stream.read_exact(&mut body)?;
        trace!("read frame {header:?}");
        Ok((header, body))
    }

    /// Writes `reply` as the answer to request `response_to`.
    pub fn write_reply(&mut self, response_to: i32, reply: &Reply) -> Result<(), TransportError> {
        let body = reply
            .to_bytes()
            .map_err(|e| TransportError::Frame(e.to_string()))?;
        let header = FrameHeader {
            length: (HEADER_SIZE + body.len()) as i32,
            request_id: rand::thread_rng().r#gen(),
            response_to,
            opcode: opcode::REPLY,
        };
        self.stream.write_all(&header.to_bytes())?;
        self.stream.write_all(&body)?;
        self.stream.flush()?;
        Ok(())
    }
}
