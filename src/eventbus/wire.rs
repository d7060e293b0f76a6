//! Message framing for transports.
//!
//! Frame format:
//! ```text
//! ┌──────────┬─────────┬──────────┬──────────────┬─────────┬─────────┬──────────┐
//! │ len (4B) │ ver(1B) │ codec(1B)│ [codec name] │ send(1B)│ address │ reply to │
//! │ u32 BE   │ u8      │ i8       │ if codec = -1│ u8      │ string  │ string   │
//! ├──────────┴─────────┴──────────┴──────────────┴─────────┴─────────┴──────────┤
//! │ header count u32 BE │ (name, value)* │ body (rest of frame)                   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//! Strings are a u32 BE length followed by UTF-8. An empty reply address
//! means none. Length covers everything after the 4-byte prefix.

use super::message::MultiMap;
use crate::types::{CodecError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Current frame version.
pub const WIRE_VERSION: u8 = 1;

/// Default cap on frame size accepted by [`read_frame`].
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// A message in transport form: envelope plus codec-encoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub address: String,
    pub reply_address: Option<String>,
    pub headers: MultiMap,
    pub send: bool,
    /// System codec id, or -1 for a user codec named by `codec_name`.
    pub codec_id: i8,
    pub codec_name: Option<String>,
    pub body: Bytes,
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::decode("frame", reason)
}

fn put_string(buffer: &mut BytesMut, value: &str) {
    buffer.put_u32(value.len() as u32);
    buffer.put_slice(value.as_bytes());
}

fn get_u32(buffer: &mut &[u8], field: &str) -> std::result::Result<u32, CodecError> {
    if buffer.remaining() < 4 {
        return Err(malformed(format!("truncated {}", field)));
    }
    Ok(buffer.get_u32())
}

fn get_u8(buffer: &mut &[u8], field: &str) -> std::result::Result<u8, CodecError> {
    if !buffer.has_remaining() {
        return Err(malformed(format!("truncated {}", field)));
    }
    Ok(buffer.get_u8())
}

fn get_string(buffer: &mut &[u8], field: &str) -> std::result::Result<String, CodecError> {
    let len = get_u32(buffer, field)? as usize;
    if buffer.remaining() < len {
        return Err(malformed(format!("truncated {}", field)));
    }
    let current: &[u8] = *buffer;
    let (bytes, rest) = current.split_at(len);
    let value = std::str::from_utf8(bytes)
        .map_err(|e| malformed(format!("{} is not UTF-8: {}", field, e)))?
        .to_string();
    *buffer = rest;
    Ok(value)
}

impl WireFrame {
    /// Encode the frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(64 + self.address.len() + self.body.len());
        buffer.put_u32(0);
        buffer.put_u8(WIRE_VERSION);
        buffer.put_i8(self.codec_id);
        if self.codec_id == -1 {
            put_string(&mut buffer, self.codec_name.as_deref().unwrap_or_default());
        }
        buffer.put_u8(u8::from(self.send));
        put_string(&mut buffer, &self.address);
        put_string(&mut buffer, self.reply_address.as_deref().unwrap_or_default());
        buffer.put_u32(self.headers.len() as u32);
        for (name, value) in self.headers.iter() {
            put_string(&mut buffer, name);
            put_string(&mut buffer, value);
        }
        buffer.put_slice(&self.body);

        let len = (buffer.len() - 4) as u32;
        buffer[..4].copy_from_slice(&len.to_be_bytes());
        buffer.freeze()
    }

    /// Decode a frame body (everything after the length prefix).
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut buffer = frame;
        let version = get_u8(&mut buffer, "version")?;
        if version != WIRE_VERSION {
            return Err(malformed(format!("unsupported version {}", version)).into());
        }
        let codec_id = get_u8(&mut buffer, "codec id")? as i8;
        let codec_name = if codec_id == -1 {
            Some(get_string(&mut buffer, "codec name")?)
        } else {
            None
        };
        let send = get_u8(&mut buffer, "send flag")? != 0;
        let address = get_string(&mut buffer, "address")?;
        if address.is_empty() {
            return Err(malformed("empty address").into());
        }
        let reply_address = Some(get_string(&mut buffer, "reply address")?).filter(|a| !a.is_empty());

        let count = get_u32(&mut buffer, "header count")?;
        let mut headers = MultiMap::new();
        for _ in 0..count {
            let name = get_string(&mut buffer, "header name")?;
            let value = get_string(&mut buffer, "header value")?;
            headers.add(name, value);
        }

        Ok(Self {
            address,
            reply_address,
            headers,
            send,
            codec_id,
            codec_name,
            body: Bytes::copy_from_slice(buffer),
        })
    }
}

/// Read one frame. Returns `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R, max_frame_bytes: u32) -> Result<Option<WireFrame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(malformed(format!("frame too large: {} bytes", frame_len)).into());
    }

    let mut frame = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame).await?;
    WireFrame::decode(&frame).map(Some)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &WireFrame) -> Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
