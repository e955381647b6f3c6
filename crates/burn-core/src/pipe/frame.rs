//! Message framing.
//!
//! Every message is `[u32 type][u32 length][length bytes]`, host byte order
//! (little-endian on every supported platform). A stream that ends before a
//! full header arrives is treated as a graceful end of stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::PipeError;

/// Child to parent: a log line to write into the parent's log.
pub const MESSAGE_TYPE_LOG: u32 = 0xF000_0001;
/// Completion of the message in flight. Payload: `u32` result.
pub const MESSAGE_TYPE_COMPLETE: u32 = 0xF000_0002;
/// Ends a session. Payload: `u32` exit code, optional `u32` restart flag.
pub const MESSAGE_TYPE_TERMINATE: u32 = 0xF000_0003;
/// Orderly disconnect. No payload.
pub const MESSAGE_TYPE_DISCONNECT: u32 = 0xFFFF_FFFF;

/// Largest payload a peer may announce.
pub const MAX_PAYLOAD_BYTES: u32 = 64 * 1024 * 1024;

const HEADER_BYTES: usize = 8;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeMessage {
    pub message_type: u32,
    pub payload: Vec<u8>,
}

impl PipeMessage {
    pub fn new(message_type: u32, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    pub fn reader(&self) -> PayloadReader<'_> {
        PayloadReader::new(&self.payload)
    }
}

/// Write one message and flush.
pub async fn write_message<W>(
    writer: &mut W,
    message_type: u32,
    payload: &[u8],
) -> Result<(), PipeError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_BYTES)
        .ok_or(PipeError::PayloadTooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(HEADER_BYTES + payload.len());
    frame.extend_from_slice(&message_type.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. `None` means the peer closed the stream (or sent a
/// disconnect) between messages.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<PipeMessage>, PipeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_BYTES];
    if !read_full_or_eof(reader, &mut header).await? {
        return Ok(None);
    }
    let message_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if message_type == MESSAGE_TYPE_DISCONNECT {
        return Ok(None);
    }
    if len > MAX_PAYLOAD_BYTES {
        return Err(PipeError::PayloadTooLarge(len as usize));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| PipeError::Truncated)?;
    Ok(Some(PipeMessage {
        message_type,
        payload,
    }))
}

/// Fill `buf`, returning `false` when the stream ends before it is full.
pub(crate) async fn read_full_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, PipeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Builds a binary payload of `u32` fields.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads `u32` fields from a payload.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }
}
