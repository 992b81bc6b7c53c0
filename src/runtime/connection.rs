//! Per-peer connection state and the positional connection table.
//!
//! Peers live in the table in accept order. Closing is a two-phase
//! affair: errors only set a flag, and the end-of-tick compaction scan
//! reaps flagged entries, returns their queued buffers to the pool, and
//! re-registers any entry that moved to a new position.

use std::io::{self, Write};
use std::time::SystemTime;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::clock;
use crate::limits::MAX_CONN;
use crate::protocol;
use crate::runtime::buffer::{Buffer, BufferPool, SendQueue};

const DEFAULT_NICK: &[u8] = b"anonym";

/// State for one connected peer.
#[derive(Debug)]
pub struct Connection {
    pub(crate) stream: TcpStream,
    closed: bool,
    nick: Vec<u8>,
    last_seen: SystemTime,
    pub(crate) input: Buffer,
    pub(crate) sendq: SendQueue,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: false,
            nick: DEFAULT_NICK.to_vec(),
            last_seen: clock::now(),
            input: Buffer::new(),
            sendq: SendQueue::new(),
        }
    }

    pub fn nick(&self) -> &[u8] {
        &self.nick
    }

    pub fn set_nick(&mut self, nick: &[u8]) {
        self.nick = nick.to_vec();
    }

    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    pub fn set_last_seen(&mut self, at: SystemTime) {
        self.last_seen = at;
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Flag for reaping; the socket stays open until compaction.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn has_pending_output(&self) -> bool {
        !self.sendq.is_empty()
    }

    /// Readiness interest, readable XOR writable: a connection with
    /// pending output is never read from.
    pub fn interest(&self) -> Interest {
        if self.sendq.is_empty() {
            Interest::READABLE
        } else {
            Interest::WRITABLE
        }
    }

    /// Queue one response line followed by its terminator. This is the
    /// only path by which the protocol produces output.
    pub fn send_package(&mut self, pool: &mut BufferPool, bytes: &[u8]) -> io::Result<()> {
        self.sendq.enqueue(pool, bytes)?;
        self.sendq.enqueue(pool, protocol::CRLF)
    }

    /// Transmit queued buffers until empty or would-block.
    ///
    /// Returns `Ok(true)` once the queue is fully drained, `Ok(false)` on
    /// would-block. Hard send errors propagate; the caller treats them as
    /// fatal.
    pub fn drain(&mut self, pool: &mut BufferPool) -> io::Result<bool> {
        while let Some(head) = self.sendq.head() {
            let buf = pool.buffer(head);
            let pending = &buf.data[self.sendq.cursor()..buf.used];
            match self.stream.write(pending) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "send wrote zero bytes",
                    ))
                }
                Ok(n) => self.sendq.advance(pool, n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Positional table of peer connections, accept order preserved.
///
/// The listening socket is tracked by the event loop and counts against
/// `MAX_CONN`; peers occupy the remaining capacity.
#[derive(Debug)]
pub struct ConnTable {
    conns: Vec<Connection>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            conns: Vec::with_capacity(MAX_CONN - 1),
        }
    }

    pub fn is_full(&self) -> bool {
        self.conns.len() + 1 >= MAX_CONN
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Append a connection, returning its table index.
    pub fn push(&mut self, conn: Connection) -> usize {
        self.conns.push(conn);
        self.conns.len() - 1
    }

    pub fn get(&self, idx: usize) -> Option<&Connection> {
        self.conns.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Connection> {
        self.conns.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.iter()
    }

    /// Reap flagged connections: a two-index scan keeps survivors in
    /// order, survivors that moved are re-registered under their new
    /// index, and reaped sockets are deregistered, their queued buffers
    /// released, and closed on drop.
    pub fn compact(&mut self, registry: &Registry, pool: &mut BufferPool) -> io::Result<()> {
        let len = self.conns.len();
        let mut kept = 0;
        for scan in 0..len {
            if self.conns[scan].closed {
                continue;
            }
            if scan != kept {
                self.conns.swap(scan, kept);
                let conn = &mut self.conns[kept];
                let interest = conn.interest();
                registry.reregister(&mut conn.stream, Token(kept), interest)?;
            }
            kept += 1;
        }
        if kept < len {
            for conn in &mut self.conns[kept..] {
                let _ = registry.deregister(&mut conn.stream);
                conn.sendq.release_all(pool);
            }
            debug!(reaped = len - kept, remaining = kept, "reaped closed connections");
            self.conns.truncate(kept);
        }
        Ok(())
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}
