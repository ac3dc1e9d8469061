//! Length-prefixed framing primitives shared by the RPC client and server.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::error::{WireError, WireResult};

/// Writes a big-endian `u64` length prefix followed by `data`.
pub async fn write_bytes<W>(w: &mut W, data: &[u8]) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_u64(data.len() as u64).await?;
    if !data.is_empty() {
        w.write_all(data).await?;
    }
    Ok(())
}

/// Writes a string as a length-prefixed byte frame.
pub async fn write_string<W>(w: &mut W, s: &str) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_bytes(w, s.as_bytes()).await
}

pub async fn write_u32<W>(w: &mut W, v: u32) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_u32(v).await?;
    Ok(())
}

pub async fn write_u64<W>(w: &mut W, v: u64) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_u64(v).await?;
    Ok(())
}

pub async fn write_bool<W>(w: &mut W, v: bool) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(v as u8).await?;
    Ok(())
}

pub async fn write_byte<W>(w: &mut W, v: u8) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(v).await?;
    Ok(())
}

/// Reads a length-prefixed byte frame, rejecting frames larger than `max`.
pub async fn read_bytes<R>(r: &mut R, max: usize) -> WireResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let size = r.read_u64().await?;
    if size > max as u64 {
        return Err(WireError::TooLarge { size, max });
    }
    let mut buf = vec![0u8; size as usize];
    if size > 0 {
        r.read_exact(&mut buf).await?;
    }
    Ok(buf)
}

/// Reads a length-prefixed frame and interprets it as UTF-8.
///
/// Protocol strings (rpc names, label names, error messages) are produced
/// from Rust strings on the sending side; invalid UTF-8 here means a broken
/// or hostile peer, so it is treated as lossy rather than fatal.
pub async fn read_string<R>(r: &mut R, max: usize) -> WireResult<String>
where
    R: AsyncRead + Unpin,
{
    let buf = read_bytes(r, max).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub async fn read_u32<R>(r: &mut R) -> WireResult<u32>
where
    R: AsyncRead + Unpin,
{
    Ok(r.read_u32().await?)
}

pub async fn read_u64<R>(r: &mut R) -> WireResult<u64>
where
    R: AsyncRead + Unpin,
{
    Ok(r.read_u64().await?)
}

pub async fn read_bool<R>(r: &mut R) -> WireResult<bool>
where
    R: AsyncRead + Unpin,
{
    Ok(r.read_u8().await? != 0)
}

pub async fn read_byte<R>(r: &mut R) -> WireResult<u8>
where
    R: AsyncRead + Unpin,
{
    Ok(r.read_u8().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bytes_roundtrip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello").await.unwrap();
        write_bytes(&mut buf, b"").await.unwrap();
        write_u32(&mut buf, 42).await.unwrap();
        write_u64(&mut buf, u64::MAX).await.unwrap();
        write_bool(&mut buf, true).await.unwrap();
        write_byte(&mut buf, 7).await.unwrap();

        let mut r = buf.as_slice();
        assert_eq!(read_bytes(&mut r, 1024).await.unwrap(), b"hello");
        assert_eq!(read_bytes(&mut r, 1024).await.unwrap(), b"");
        assert_eq!(read_u32(&mut r).await.unwrap(), 42);
        assert_eq!(read_u64(&mut r).await.unwrap(), u64::MAX);
        assert!(read_bool(&mut r).await.unwrap());
        assert_eq!(read_byte(&mut r).await.unwrap(), 7);
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn test_size_ceiling_enforced() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &[0u8; 100]).await.unwrap();

        let mut r = buf.as_slice();
        let err = read_bytes(&mut r, 99).await.unwrap_err();
        assert!(matches!(err, WireError::TooLarge { size: 100, max: 99 }));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        // Length prefix declares 10 bytes, only 3 follow.
        let mut buf = Vec::new();
        write_u64(&mut buf, 10).await.unwrap();
        buf.extend_from_slice(&[1, 2, 3]);

        let mut r = buf.as_slice();
        assert!(matches!(
            read_bytes(&mut r, 1024).await.unwrap_err(),
            WireError::Io(_)
        ));
    }

    #[tokio::test]
    async fn test_string_roundtrip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "latency_seconds").await.unwrap();
        let mut r = buf.as_slice();
        assert_eq!(read_string(&mut r, 64).await.unwrap(), "latency_seconds");
    }
}
