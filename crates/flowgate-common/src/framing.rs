//! Wire framing: `u32` little-endian length, then that many bytes of JSON.
//!
//! The length is validated before any payload allocation; an oversized
//! frame is an error the connection layer answers by closing, never by
//! responding.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{consts, Error, Result};

/// Reads one frame. `Ok(None)` is a clean end of stream before any length
/// byte arrived.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(Error::Ipc(format!("frame length read failed: {err}"))),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > consts::MAX_MESSAGE_SIZE {
        return Err(Error::RequestTooLarge {
            size: len,
            max: consts::MAX_MESSAGE_SIZE,
        });
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| Error::Ipc(format!("frame payload read failed: {err}")))?;
    Ok(Some(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > consts::MAX_MESSAGE_SIZE {
        return Err(Error::RequestTooLarge {
            size: payload.len(),
            max: consts::MAX_MESSAGE_SIZE,
        });
    }
    let len = (payload.len() as u32).to_le_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|err| Error::Ipc(format!("frame length write failed: {err}")))?;
    writer
        .write_all(payload)
        .await
        .map_err(|err| Error::Ipc(format!("frame payload write failed: {err}")))?;
    writer
        .flush()
        .await
        .map_err(|err| Error::Ipc(format!("frame flush failed: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, br#"{"type":"ping"}"#).await.unwrap();
        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame, br#"{"type":"ping"}"#);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_reading_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let oversized = (consts::MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &oversized)
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestTooLarge);
    }

    #[tokio::test]
    async fn boundary_size_is_accepted() {
        let (mut client, mut server) = tokio::io::duplex(consts::MAX_MESSAGE_SIZE + 16);
        let payload = vec![b'x'; consts::MAX_MESSAGE_SIZE];
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &payload).await.unwrap();
        });
        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame.len(), consts::MAX_MESSAGE_SIZE);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_write_is_refused_locally() {
        let (mut client, _server) = tokio::io::duplex(16);
        let payload = vec![0u8; consts::MAX_MESSAGE_SIZE + 1];
        let err = write_frame(&mut client, &payload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestTooLarge);
    }

    #[tokio::test]
    async fn truncated_payload_is_an_ipc_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &8u32.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"abc").await.unwrap();
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IpcError);
    }
}
