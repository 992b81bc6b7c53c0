//! Command execution against the shared server state.
//!
//! Handlers mutate the connection table and history, and queue their
//! responses through the sender's buffer pool queue. Protocol violations
//! flag the connection for reaping; the only error that propagates is
//! pool exhaustion, which is fatal to the process.

use std::io;

use tracing::debug;

use crate::clock;
use crate::history::History;
use crate::limits::{BUF_CAP, MAX_MSG, MAX_NICK};
use crate::protocol::{self, Command};
use crate::runtime::{BufferPool, ConnTable};

/// Execute one request line on behalf of the connection at `idx`.
pub fn dispatch(
    table: &mut ConnTable,
    idx: usize,
    line: &[u8],
    pool: &mut BufferPool,
    history: &mut History,
) -> io::Result<()> {
    let command = match protocol::parse(line) {
        Some(command) => command,
        None => {
            debug!(idx, "unknown command");
            if let Some(conn) = table.get_mut(idx) {
                conn.mark_closed();
            }
            return Ok(());
        }
    };

    match command {
        Command::SetNick(nick) => set_nick(table, idx, nick, pool),
        Command::Folks => folks(table, idx, pool),
        Command::Send(body) => send(table, idx, body, pool, history),
        Command::New => new(table, idx, pool, history),
    }
}

fn set_nick(table: &mut ConnTable, idx: usize, nick: &[u8], pool: &mut BufferPool) -> io::Result<()> {
    let Some(conn) = table.get_mut(idx) else {
        return Ok(());
    };
    if nick.len() > MAX_NICK {
        debug!(idx, len = nick.len(), "nickname too long");
        conn.mark_closed();
        return Ok(());
    }
    conn.set_nick(nick);
    conn.send_package(pool, protocol::RESP_OK)
}

fn folks(table: &mut ConnTable, idx: usize, pool: &mut BufferPool) -> io::Result<()> {
    // snapshot the roster first; the reply is queued on one of its members
    let nicks: Vec<Vec<u8>> = table.iter().map(|conn| conn.nick().to_vec()).collect();
    let Some(conn) = table.get_mut(idx) else {
        return Ok(());
    };
    conn.send_package(pool, nicks.len().to_string().as_bytes())?;
    for nick in &nicks {
        conn.send_package(pool, nick)?;
    }
    Ok(())
}

fn send(
    table: &mut ConnTable,
    idx: usize,
    body: &[u8],
    pool: &mut BufferPool,
    history: &mut History,
) -> io::Result<()> {
    let Some(conn) = table.get_mut(idx) else {
        return Ok(());
    };
    if body.len() > MAX_MSG {
        debug!(idx, len = body.len(), "message too long");
        conn.mark_closed();
        return Ok(());
    }
    history.append(conn.nick(), body, clock::now());
    conn.send_package(pool, protocol::RESP_OK)
}

fn new(
    table: &mut ConnTable,
    idx: usize,
    pool: &mut BufferPool,
    history: &mut History,
) -> io::Result<()> {
    let Some(conn) = table.get_mut(idx) else {
        return Ok(());
    };
    let fresh = history.since(conn.last_seen());
    conn.send_package(pool, fresh.len().to_string().as_bytes())?;
    for entry in fresh {
        let Some((hour, min, sec)) = clock::local_hms(entry.time) else {
            debug!(idx, "wall-clock formatting failed");
            conn.mark_closed();
            return Ok(());
        };
        let mut line = Vec::with_capacity(BUF_CAP);
        line.extend_from_slice(format!("[{hour:02}:{min:02}:{sec:02}] ").as_bytes());
        line.extend_from_slice(&entry.nick);
        line.extend_from_slice(b": ");
        line.extend_from_slice(&entry.body);
        conn.send_package(pool, &line)?;
    }
    conn.set_last_seen(clock::now());
    Ok(())
}
