//! # Wire Framing
//!
//! Every message is one complete length-prefixed payload: an 8-character
//! uppercase-hex ASCII length, then exactly that many opaque bytes. The
//! maximum message length is `u32::MAX` (the widest value the 8-char
//! header can express).
//!
//! Reads and writes are not thread-safe on their own; the kernel client
//! and server serialize access to each half.

use super::{map_channel_error, BoxedReader, BoxedWriter};
use crate::error::{Result, TwinError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

const HEADER_LEN: usize = 8;

/// Reads one length-prefixed payload per call.
pub struct FramedReader {
    inner: BoxedReader,
}

impl FramedReader {
    pub fn new(inner: BoxedReader) -> Self {
        Self { inner }
    }

    /// Read exactly one frame. EOF or a torn-down descriptor during
    /// either the header or the payload reads as a terminated channel.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; HEADER_LEN];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(map_channel_error)?;

        let header = std::str::from_utf8(&header)
            .map_err(|_| TwinError::Protocol("frame header is not ASCII hex".into()))?;
        let len = usize::from_str_radix(header, 16)
            .map_err(|_| TwinError::Protocol(format!("bad frame header {header:?}")))?;

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(map_channel_error)?;
        trace!(len, "read frame");
        Ok(payload)
    }
}

/// Writes one length-prefixed payload per call.
pub struct FramedWriter {
    inner: BoxedWriter,
}

impl FramedWriter {
    pub fn new(inner: BoxedWriter) -> Self {
        Self { inner }
    }

    /// Write one complete frame and flush it.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > u32::MAX as usize {
            return Err(TwinError::Protocol(format!(
                "message of {} bytes exceeds framing limit",
                payload.len()
            )));
        }
        let header = format!("{:08X}", payload.len());
        self.inner
            .write_all(header.as_bytes())
            .await
            .map_err(map_channel_error)?;
        self.inner
            .write_all(payload)
            .await
            .map_err(map_channel_error)?;
        self.inner.flush().await.map_err(map_channel_error)?;
        trace!(len = payload.len(), "wrote frame");
        Ok(())
    }
}
