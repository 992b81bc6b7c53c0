//! Protocol and capacity limits.
//!
//! These are wire-contract constants, not tunables: peers rely on the
//! nickname and message bounds, and the buffer capacity is derived from
//! the longest line the server ever emits.

/// Maximum nickname length in bytes.
pub const MAX_NICK: usize = 20;

/// Maximum message-body length in bytes.
pub const MAX_MSG: usize = 140;

/// Width of the `[HH:MM:SS]` timestamp rendered in front of history lines.
pub const TS_LEN: usize = 10;

/// Capacity of every input and pool buffer.
///
/// Sized for the longest outbound line: timestamp, nickname, message body,
/// plus the `" "`, `":"`, `" "` separators.
pub const BUF_CAP: usize = TS_LEN + MAX_NICK + MAX_MSG + 3;

/// Message history capacity.
pub const MAX_HIST: usize = 50;

/// Connection-table capacity, listener included.
pub const MAX_CONN: usize = 1024;

/// Number of buffers in the shared pool.
pub const POOL_SIZE: usize = 16;
