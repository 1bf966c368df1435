//! Wire framing (big-endian length prefix).
//!
//! Every frame is a 4-byte big-endian length followed by the payload. A
//! request is two frames (tag, body); a response is two frames (status,
//! body).

use std::io::{Read, Write};

use super::ProtocolError;

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Read one frame. `Ok(None)` means the peer closed cleanly between
    /// frames; a close mid-frame is bad framing.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::Framing("frame header truncated".to_string()));
            }
            read += n;
        }

        let length = u32::from_be_bytes(header) as usize;
        if length > self.max_frame_bytes {
            return Err(ProtocolError::Framing(format!(
                "frame of {length} bytes exceeds max {}",
                self.max_frame_bytes
            )));
        }

        let mut body = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            let n = self.reader.read(&mut body[read_body..])?;
            if n == 0 {
                return Err(ProtocolError::Framing("frame body truncated".to_string()));
            }
            read_body += n;
        }
        Ok(Some(body))
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = encode_frame(payload)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let length = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::Framing("frame length exceeds u32".to_string()))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::Framing(format!(
            "frame of {} bytes exceeds max {MAX_FRAME_BYTES}",
            payload.len()
        )));
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}
