//! Connection handshake and compression negotiation.
//!
//! Immediately after connecting, the client sends the protocol magic and a
//! bool asking for compressed block frames; the server answers with its own
//! magic and the final decision. Compression only ever applies to metric
//! block frames in search responses, since request traffic is small and not
//! worth compressing.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::wire::codec::{read_bool, read_bytes, write_bool, write_bytes};
use crate::wire::error::{WireError, WireResult};
use crate::wire::MAX_HANDSHAKE_SIZE;

/// Protocol identifier exchanged by both sides before any rpc traffic.
pub const HANDSHAKE_MAGIC: &[u8] = b"meridian.rpc.v1";

/// Result of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Whether metric block frames on this connection are lz4-compressed.
    pub compression: bool,
}

/// Performs the client side of the handshake on a fresh connection.
pub async fn client_handshake<S>(stream: &mut S, want_compression: bool) -> WireResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_bytes(stream, HANDSHAKE_MAGIC).await?;
    write_bool(stream, want_compression).await?;
    tokio::io::AsyncWriteExt::flush(stream).await?;

    let magic = read_bytes(stream, MAX_HANDSHAKE_SIZE).await?;
    if magic != HANDSHAKE_MAGIC {
        return Err(WireError::BadHandshake(magic));
    }
    let compression = read_bool(stream).await?;
    Ok(HandshakeOutcome { compression })
}

/// Performs the server side of the handshake on an accepted connection.
///
/// The negotiated outcome enables compression only when the client asked for
/// it and the server allows it.
pub async fn server_handshake<S>(stream: &mut S, allow_compression: bool) -> WireResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let magic = read_bytes(stream, MAX_HANDSHAKE_SIZE).await?;
    if magic != HANDSHAKE_MAGIC {
        return Err(WireError::BadHandshake(magic));
    }
    let want_compression = read_bool(stream).await?;
    let compression = want_compression && allow_compression;

    write_bytes(stream, HANDSHAKE_MAGIC).await?;
    write_bool(stream, compression).await?;
    tokio::io::AsyncWriteExt::flush(stream).await?;

    Ok(HandshakeOutcome { compression })
}
