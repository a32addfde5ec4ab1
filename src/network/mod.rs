pub mod acl;
pub mod shared;

use anyhow::{bail, ensure, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First byte of every frame.
pub const FRAME_MAGIC: u8 = 0xAA;

/// Header: magic + big-endian u16 length.
pub const FRAME_HEADER_LEN: usize = 3;

/// Largest payload a frame can carry (the length field also covers the cmd byte).
pub const MAX_PAYLOAD: usize = u16::MAX as usize - 1;

/// One decoded frame: `[0xAA][len BE u16][cmd][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(cmd: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            payload: payload.into(),
        }
    }
}

/// Encode a frame. Fails only when the payload does not fit the length field.
pub fn encode_frame(cmd: u8, payload: &[u8]) -> Result<Bytes> {
    ensure!(
        payload.len() <= MAX_PAYLOAD,
        "frame payload too large: {} bytes (max {})",
        payload.len(),
        MAX_PAYLOAD
    );
    let len = (payload.len() + 1) as u16;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + 1 + payload.len());
    buf.put_u8(FRAME_MAGIC);
    buf.put_u16(len);
    buf.put_u8(cmd);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read one 0xAA-framed packet from `stream`.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    if header[0] != FRAME_MAGIC {
        bail!("expected 0xAA header, got {:02X}", header[0]);
    }
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    if len == 0 {
        bail!("empty frame (missing cmd byte)");
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let mut body = Bytes::from(body);
    let cmd = body[0];
    let payload = body.split_off(1);
    Ok(Frame::new(cmd, payload))
}

/// Encode and write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, cmd: u8, payload: &[u8]) -> Result<()> {
    let buf = encode_frame(cmd, payload)?;
    stream.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let buf = encode_frame(0x10, b"abc").unwrap();
        assert_eq!(&buf[..], &[0xAA, 0x00, 0x04, 0x10, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let big = vec![0u8; MAX_PAYLOAD + 1];
        assert!(encode_frame(0x01, &big).is_err());
        assert!(encode_frame(0x01, &big[..MAX_PAYLOAD]).is_ok());
    }

    #[tokio::test]
    async fn test_read_back_to_back_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(0x02, &[]).unwrap());
        wire.extend_from_slice(&encode_frame(0x83, b"status").unwrap());
        let mut reader = &wire[..];

        let first = read_frame(&mut reader).await.unwrap();
        assert_eq!(first, Frame::new(0x02, Bytes::new()));
        let second = read_frame(&mut reader).await.unwrap();
        assert_eq!(second.cmd, 0x83);
        assert_eq!(&second.payload[..], b"status");
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_read_rejects_bad_magic() {
        let wire = [0xAB, 0x00, 0x01, 0x02];
        let err = read_frame(&mut &wire[..]).await.unwrap_err();
        assert!(err.to_string().contains("0xAA"));
    }

    #[tokio::test]
    async fn test_read_rejects_zero_length() {
        let wire = [0xAA, 0x00, 0x00];
        assert!(read_frame(&mut &wire[..]).await.is_err());
    }
}
