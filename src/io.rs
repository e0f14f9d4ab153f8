//! Frame I/O over async byte transports.
//!
//! The reader side returns `Ok(None)` on a clean end-of-stream at a frame
//! boundary and an error when the transport ends mid-frame. The writer side
//! emits header-then-payload as one logical operation; callers serialize
//! access so frames are never interleaved on the wire.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::MuxError;
use crate::frame::{decode_header, FrameHeader, HEADER_SIZE};

/// Read the next frame from the transport.
///
/// Returns `Ok(None)` on clean EOF (the transport ended exactly at a frame
/// boundary). A transport that ends inside a payload yields an error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(FrameHeader, Bytes)>, MuxError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(MuxError::Io(e.to_string())),
    }

    let header = decode_header(&header_buf)?;

    if header.payload_length == 0 {
        return Ok(Some((header, Bytes::new())));
    }

    let mut payload = vec![0u8; header.payload_length as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            MuxError::MalformedFrame("transport ended inside a frame payload".to_string())
        } else {
            MuxError::Io(e.to_string())
        }
    })?;

    Ok(Some((header, Bytes::from(payload))))
}

/// Write one frame (header, then payload) and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: [u8; HEADER_SIZE],
    payload: &[u8],
) -> Result<(), MuxError> {
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}
