//! Connection pool
//!
//! One live TCP connection per `host:port`, dialed lazily on first send
//! and kept until an exchange on it fails. Dialing happens outside the
//! pool lock; reads and writes lock the individual connection.
//!
//! Connections whose responses arrive asynchronously (traffic streams)
//! are put in the readiness set. The stream correlator polls that set
//! with short read timeouts instead of parking a thread per socket.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use thiserror::Error;

use crate::error::{ErrorKind, ScriptError};
use crate::symbols::lock;

/// Upper bound on a single response read
pub const MAX_RESPONSE: usize = 4096;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{address}: not a host:port address")]
    BadAddress { address: String },

    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("no response from {address} within {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("{address} closed the connection")]
    Closed { address: String },

    #[error("I/O error on {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },
}

impl From<TransportError> for ScriptError {
    fn from(err: TransportError) -> Self {
        let kind = match err {
            TransportError::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::ProtocolFailure,
        };
        ScriptError::new(kind, err.to_string())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

struct ConnState {
    stream: TcpStream,
    /// Bytes read past the last complete line
    pending: String,
}

/// A cached connection to one agent
pub struct Connection {
    address: String,
    state: Mutex<ConnState>,
    /// Held for a whole request/response exchange
    turn: Mutex<()>,
    /// Set once the pool dropped this connection
    retired: AtomicBool,
}

impl Connection {
    fn open(address: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let addr = address
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .ok_or_else(|| TransportError::BadAddress {
                address: address.to_string(),
            })?;
        let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|source| {
            TransportError::Connect {
                address: address.to_string(),
                source,
            }
        })?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            address: address.to_string(),
            state: Mutex::new(ConnState {
                stream,
                pending: String::new(),
            }),
            turn: Mutex::new(()),
            retired: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Exclusive use of the connection for one exchange. Workers sharing
    /// an agent take turns so their responses are not crossed.
    pub fn turn(&self) -> MutexGuard<'_, ()> {
        lock(&self.turn)
    }

    /// Whether the pool has dropped this connection. A reply still in
    /// flight on it belongs to an abandoned exchange.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn io_err(&self, source: io::Error) -> TransportError {
        TransportError::Io {
            address: self.address.clone(),
            source,
        }
    }

    pub fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.stream.write_all(bytes).map_err(|e| self.io_err(e))?;
        state.stream.flush().map_err(|e| self.io_err(e))
    }

    /// Blocking read of at most `maxlen` bytes. Buffered leftovers from a
    /// line poll are returned first.
    pub fn recv(&self, maxlen: usize, timeout: Duration) -> Result<String, TransportError> {
        let mut state = lock(&self.state);
        if !state.pending.is_empty() {
            return Ok(std::mem::take(&mut state.pending));
        }
        let mut buf = vec![0u8; maxlen.max(1)];
        state
            .stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| self.io_err(e))?;
        match state.stream.read(&mut buf) {
            Ok(0) => Err(TransportError::Closed {
                address: self.address.clone(),
            }),
            Ok(n) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Err(e) if is_timeout(&e) => Err(TransportError::Timeout {
                address: self.address.clone(),
                timeout,
            }),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Push text back so the next read starts with it.
    pub fn unread(&self, text: &str) {
        let mut state = lock(&self.state);
        state.pending.insert_str(0, text);
    }

    /// Return one complete line if it arrives within `wait`. Partial lines
    /// are kept and joined with the next read. `Ok(None)` means "not ready",
    /// including when another thread holds the connection.
    pub fn poll_line(&self, wait: Duration) -> Result<Option<String>, TransportError> {
        let mut state = match self.state.try_lock() {
            Ok(s) => s,
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };
        if let Some(line) = take_line(&mut state.pending) {
            return Ok(Some(line));
        }
        let mut buf = [0u8; 1024];
        state
            .stream
            .set_read_timeout(Some(wait.max(Duration::from_millis(1))))
            .map_err(|e| self.io_err(e))?;
        match state.stream.read(&mut buf) {
            Ok(0) => Err(TransportError::Closed {
                address: self.address.clone(),
            }),
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                state.pending.push_str(&chunk);
                Ok(take_line(&mut state.pending))
            }
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

fn take_line(pending: &mut String) -> Option<String> {
    let end = pending.find('\n')?;
    let line: String = pending.drain(..=end).collect();
    Some(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Process-wide map from `host:port` to its live connection
pub struct ConnectionPool {
    conns: Mutex<HashMap<String, Arc<Connection>>>,
    ready: Mutex<Vec<String>>,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            ready: Mutex::new(Vec::new()),
            connect_timeout,
        }
    }

    /// Cached connection for `address`, dialing it if needed. Concurrent
    /// callers racing for the same endpoint end up with one connection.
    pub fn connect(&self, address: &str) -> Result<Arc<Connection>, TransportError> {
        if let Some(conn) = self.get(address) {
            return Ok(conn);
        }
        tracing::debug!(address, "dialing agent");
        let fresh = Arc::new(Connection::open(address, self.connect_timeout)?);
        let mut conns = lock(&self.conns);
        Ok(Arc::clone(conns.entry(address.to_string()).or_insert(fresh)))
    }

    /// Run one request/response exchange with exclusive use of the
    /// connection to `address`. A connection retired while this caller
    /// waited for its turn is replaced by a fresh one. Any failure retires
    /// the connection, so a late reply is never read by the next exchange.
    pub fn exchange<T, F>(&self, address: &str, f: F) -> Result<T, TransportError>
    where
        F: FnOnce(&Connection) -> Result<T, TransportError>,
    {
        loop {
            let conn = self.connect(address)?;
            let _turn = conn.turn();
            if conn.is_retired() {
                continue;
            }
            let result = f(&conn);
            if result.is_err() {
                self.retire(&conn);
            }
            return result;
        }
    }

    /// Drop `conn` from the pool unless it was already replaced.
    fn retire(&self, conn: &Arc<Connection>) {
        conn.retired.store(true, Ordering::Release);
        let address = conn.address();
        {
            let mut conns = lock(&self.conns);
            if conns.get(address).is_some_and(|c| Arc::ptr_eq(c, conn)) {
                conns.remove(address);
            }
        }
        self.unwatch(address);
    }

    pub fn get(&self, address: &str) -> Option<Arc<Connection>> {
        lock(&self.conns).get(address).cloned()
    }

    /// Drop a broken connection so the next send dials again.
    pub fn forget(&self, address: &str) {
        if let Some(conn) = lock(&self.conns).remove(address) {
            conn.retired.store(true, Ordering::Release);
        }
        self.unwatch(address);
    }

    /// Add `address` to the readiness set.
    pub fn watch(&self, address: &str) {
        let mut ready = lock(&self.ready);
        if !ready.iter().any(|a| a == address) {
            ready.push(address.to_string());
        }
    }

    pub fn unwatch(&self, address: &str) {
        lock(&self.ready).retain(|a| a != address);
    }

    /// Connections currently in the readiness set
    pub fn readiness_set(&self) -> Vec<Arc<Connection>> {
        let ready = lock(&self.ready).clone();
        ready.iter().filter_map(|a| self.get(a)).collect()
    }

    /// One pass over the readiness set, spending at most `wait` per socket.
    /// Returns `(address, line)` for every complete line read.
    pub fn poll_ready(&self, wait: Duration) -> Vec<(String, String)> {
        let mut lines = Vec::new();
        for conn in self.readiness_set() {
            match conn.poll_line(wait) {
                Ok(Some(line)) => lines.push((conn.address().to_string(), line)),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(address = conn.address(), error = %err, "dropping connection");
                    self.forget(conn.address());
                }
            }
        }
        lines
    }

    pub fn len(&self) -> usize {
        lock(&self.conns).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
