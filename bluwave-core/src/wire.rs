//! Framing: length-prefix (4 bytes LE) + opaque body, with a reassembly
//! buffer. The transport delivers arbitrary chunks; frame boundaries never
//! align with read boundaries, so reads feed [`FrameBuffer`] and complete
//! frames are popped off the front.

const LEN_SIZE: usize = 4;
/// Chat frames are small; anything past this is a broken or hostile peer.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Encode one frame: 4 bytes LE length + body.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = body.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Reassembles complete frames from a byte stream read in arbitrary chunks.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes as they arrive from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame body, if one has fully arrived.
    /// `Ok(None)` means more bytes are needed; [`FrameError::TooLarge`] means
    /// the stream is unrecoverable and the connection should be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < LEN_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge);
        }
        let total = LEN_SIZE + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let body = self.buf[LEN_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(body))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large")]
    TooLarge,
}
