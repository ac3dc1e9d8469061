//! Persistent connection pool for one storage node.
//!
//! Connections are dialed lazily, handshaken once and then parked in an idle
//! list between requests. Callers must hand healthy connections back with
//! [`ConnPool::put`]; broken connections are simply dropped. Idle
//! connections unused for longer than the TTL are discarded on the next
//! acquisition instead of reused, which shrinks the pool again after load
//! spikes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::client::error::{ClientError, ClientResult};
use crate::wire::{client_handshake, WireError};

/// How long an idle pooled connection stays eligible for reuse.
const IDLE_CONN_TTL: Duration = Duration::from_secs(120);

/// One pooled connection with its negotiated parameters.
#[derive(Debug)]
pub struct Connection {
    pub stream: tokio::io::BufStream<TcpStream>,
    /// Whether metric block frames on this connection are compressed.
    pub compression: bool,
    pub addr: String,
}

struct IdleConn {
    conn: Connection,
    parked_at: Instant,
}

/// Connection pool for a single storage node address.
pub struct ConnPool {
    addr: String,
    dial_timeout: Duration,
    want_compression: bool,
    idle: Mutex<PoolState>,
}

struct PoolState {
    conns: VecDeque<IdleConn>,
    stopped: bool,
}

impl ConnPool {
    pub fn new(addr: String, dial_timeout: Duration, want_compression: bool) -> Self {
        Self {
            addr,
            dial_timeout,
            want_compression,
            idle: Mutex::new(PoolState {
                conns: VecDeque::new(),
                stopped: false,
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns a pooled connection, dialing a new one when the idle list is
    /// empty. Stale idle connections are closed instead of reused.
    pub async fn get(&self) -> ClientResult<Connection> {
        {
            let mut state = self.idle.lock().await;
            if state.stopped {
                return Err(ClientError::PoolStopped(self.addr.clone()));
            }
            while let Some(ic) = state.conns.pop_back() {
                if ic.parked_at.elapsed() < IDLE_CONN_TTL {
                    return Ok(ic.conn);
                }
                // Stale; dropping closes the socket.
            }
        }
        self.dial().await
    }

    /// Returns a healthy connection to the idle list. Connections handed to
    /// a stopped pool are closed immediately.
    pub async fn put(&self, conn: Connection) {
        let mut state = self.idle.lock().await;
        if !state.stopped {
            state.conns.push_back(IdleConn {
                conn,
                parked_at: Instant::now(),
            });
        }
    }

    /// Closes all idle connections and makes subsequent [`ConnPool::get`]
    /// calls fail fast.
    pub async fn stop(&self) {
        let mut state = self.idle.lock().await;
        state.stopped = true;
        state.conns.clear();
    }

    async fn dial(&self) -> ClientResult<Connection> {
        let stream = timeout(self.dial_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("cannot dial {} within {:?}", self.addr, self.dial_timeout),
                ))
            })??;
        stream.set_nodelay(true)?;

        let mut stream = tokio::io::BufStream::new(stream);
        let outcome = timeout(
            self.dial_timeout,
            client_handshake(&mut stream, self.want_compression),
        )
        .await
        .map_err(|_| {
            ClientError::Wire(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("handshake with {} timed out", self.addr),
            )))
        })??;

        tracing::debug!(
            addr = %self.addr,
            compression = outcome.compression,
            "established storage node connection"
        );
        Ok(Connection {
            stream,
            compression: outcome.compression,
            addr: self.addr.clone(),
        })
    }
}
