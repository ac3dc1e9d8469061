//! Wire protocol primitives for the Meridian query RPC protocol.
//!
//! Every variable-length value on the wire is framed as a big-endian `u64`
//! length followed by that many bytes. Numeric scalars are fixed-width
//! big-endian fields and bools are a single byte. The same framing is used in
//! both directions by the query-tier client ([`crate::client`]) and the
//! storage-node server ([`crate::server`]).
//!
//! Size ceilings are enforced on every variable-length read. Exceeding a
//! ceiling is a hard protocol error: the affected connection cannot be reused
//! because the remaining stream position is unknown.

mod codec;
mod error;
mod handshake;

pub use codec::{
    read_bool, read_byte, read_bytes, read_string, read_u32, read_u64, write_bool, write_byte,
    write_bytes, write_string, write_u32, write_u64,
};
pub use error::WireError;
pub use handshake::{client_handshake, server_handshake, HandshakeOutcome};

/// Maximum size of an rpc name sent at the start of a call.
pub const MAX_RPC_NAME_SIZE: usize = 128;

/// Maximum size of an error message transmitted in the error sentinel slot.
pub const MAX_ERROR_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum size of a serialized [`crate::model::SearchQuery`].
pub const MAX_SEARCH_QUERY_SIZE: usize = 1024 * 1024;

/// Maximum size of a serialized metric block.
pub const MAX_METRIC_BLOCK_SIZE: usize = 1024 * 1024;

/// Maximum size of a metric block frame on the wire. Slightly above
/// [`MAX_METRIC_BLOCK_SIZE`] since an incompressible block grows a little
/// under lz4 framing.
pub const MAX_METRIC_BLOCK_FRAME_SIZE: usize = MAX_METRIC_BLOCK_SIZE + 64 * 1024;

/// Maximum size of a single label name, label value or tag key.
pub const MAX_LABEL_VALUE_SIZE: usize = 16 * 1024;

/// Maximum size of a serialized metric name.
pub const MAX_METRIC_NAME_SIZE: usize = 64 * 1024;

/// Maximum size of a raw metric name in a registration request.
pub const MAX_METRIC_NAME_RAW_SIZE: usize = 1024 * 1024;

/// Maximum number of metric names in a single registration request.
pub const MAX_METRIC_NAMES_PER_REQUEST: u64 = 1024 * 1024;

/// Maximum size of the trace payload appended to every response.
pub const MAX_TRACE_SIZE: usize = 1024 * 1024;

/// Maximum size of a handshake frame.
pub const MAX_HANDSHAKE_SIZE: usize = 64;
