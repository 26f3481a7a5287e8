//! Framed async reads and writes.
//!
//! Exact-size reads driven by the wire format: 8 preamble bytes say how
//! long the header is, the header is followed by a 4- or 8-byte PLEN, and
//! PLEN bounds the payload read before any allocation is made for it. The
//! accumulated bytes then go through the same `Frame::decode_bounded` path
//! as slice parsing, so async and sync inputs validate identically.

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use xcp_proto::{Frame, Preamble, ProtocolError};

use crate::error::{Result, SessionError};

/// Read one frame, enforcing the negotiated payload bound.
///
/// Returns `Ok(None)` on a clean end-of-stream (the peer closed between
/// frames). An EOF mid-frame is an error.
///
/// # Errors
///
/// - `SessionError::Wire` for any parse/validation failure, including
///   `FrameTooLarge` when PLEN exceeds `max_payload_bytes`
/// - `SessionError::Transport` for I/O failures and mid-frame EOF
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload_bytes: u64,
) -> Result<Option<Frame>> {
    let mut buf = Vec::with_capacity(256);

    // First byte decides clean-EOF vs mid-frame EOF.
    let mut first = [0u8; 1];
    match reader.read(&mut first).await {
        Ok(0) => return Ok(None),
        Ok(_) => buf.push(first[0]),
        Err(e) => return Err(e.into()),
    }

    buf.resize(Preamble::LEN, 0);
    reader.read_exact(&mut buf[1..]).await.map_err(mid_frame_eof)?;
    let preamble = Preamble::decode(&buf)?;

    let header_len = preamble.header_len as usize;
    let plen_width = preamble.flags.plen_width();
    let mut offset = buf.len();
    buf.resize(offset + header_len + plen_width, 0);
    reader.read_exact(&mut buf[offset..]).await.map_err(mid_frame_eof)?;

    let mut plen_bytes = &buf[offset + header_len..];
    let payload_len = if preamble.flags.is_large() {
        plen_bytes.get_u64_le()
    } else {
        u64::from(plen_bytes.get_u32_le())
    };
    if payload_len > max_payload_bytes {
        return Err(ProtocolError::FrameTooLarge { size: payload_len, max: max_payload_bytes }
            .into());
    }
    let payload_len = usize::try_from(payload_len).map_err(|_| {
        SessionError::Wire(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: usize::MAX as u64,
        })
    })?;

    offset = buf.len();
    buf.resize(offset + payload_len + Frame::CRC_LEN, 0);
    reader.read_exact(&mut buf[offset..]).await.map_err(mid_frame_eof)?;

    let (frame, consumed) = Frame::decode_bounded(&buf, max_payload_bytes)?;
    debug_assert_eq!(consumed, buf.len());
    Ok(Some(frame))
}

/// Write one frame and flush.
///
/// # Errors
///
/// - `SessionError::Wire` if encoding fails
/// - `SessionError::Transport` on I/O failure
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let mut wire = Vec::with_capacity(frame.encoded_len(xcp_proto::HeaderForm::Binary));
    frame.encode(&mut wire)?;
    writer.write_all(&wire).await?;
    writer.flush().await?;
    Ok(())
}

fn mid_frame_eof(err: std::io::Error) -> SessionError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        SessionError::Transport("connection closed mid-frame".to_string())
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use xcp_proto::{CODEC_JSON, FrameFlags, FrameHeader, MsgType};

    use super::*;

    fn sample_frame() -> Frame {
        let header = FrameHeader::control(MsgType::Ping, CODEC_JSON);
        Frame::new(header, Bytes::from_static(b"{\"nonce\":7}"), FrameFlags::new())
    }

    #[tokio::test]
    async fn write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let frame = sample_frame();
        write_frame(&mut client, &frame).await.unwrap();

        let read = read_frame(&mut server, 1 << 20).await.unwrap().unwrap();
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let result = read_frame(&mut server, 1 << 20).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn mid_frame_eof_is_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut wire = Vec::new();
        sample_frame().encode(&mut wire).unwrap();
        client.write_all(&wire[..wire.len() / 2]).await.unwrap();
        drop(client);

        let result = read_frame(&mut server, 1 << 20).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
    }

    #[tokio::test]
    async fn oversize_frame_rejected_before_payload_read() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);

        let header = FrameHeader::control(MsgType::Ping, CODEC_JSON);
        let frame = Frame::new(header, vec![0u8; 1024], FrameFlags::new());
        let mut wire = Vec::new();
        frame.encode(&mut wire).unwrap();

        let write = tokio::spawn(async move {
            let _ = client.write_all(&wire).await;
            client
        });

        let result = read_frame(&mut server, 100).await;
        assert!(matches!(
            result,
            Err(SessionError::Wire(ProtocolError::FrameTooLarge { size: 1024, max: 100 }))
        ));
        drop(write.await);
    }

    #[tokio::test]
    async fn several_frames_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);

        for _ in 0..3 {
            write_frame(&mut client, &sample_frame()).await.unwrap();
        }
        drop(client);

        for _ in 0..3 {
            assert!(read_frame(&mut server, 1 << 20).await.unwrap().is_some());
        }
        assert!(read_frame(&mut server, 1 << 20).await.unwrap().is_none());
    }
}
