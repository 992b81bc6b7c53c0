//! Server-wide broadcast history.
//!
//! A bounded sequence of recently relayed messages, newest first. Each
//! connection keeps a wall-clock cursor; `since` hands back exactly the
//! entries strictly newer than that cursor, oldest first, so a client
//! polling twice in a row never sees a message again.

use std::time::SystemTime;

use crate::limits::MAX_HIST;

/// One relayed message, stored by value.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub nick: Vec<u8>,
    pub body: Vec<u8>,
    pub time: SystemTime,
}

/// Bounded most-recent-first message history.
#[derive(Debug)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_HIST),
        }
    }

    /// Insert a message at the front, dropping the oldest entry once the
    /// history is full.
    pub fn append(&mut self, nick: &[u8], body: &[u8], time: SystemTime) {
        self.entries.insert(
            0,
            HistoryEntry {
                nick: nick.to_vec(),
                body: body.to_vec(),
                time,
            },
        );
        self.entries.truncate(MAX_HIST);
    }

    /// Entries strictly newer than `cursor`, oldest first.
    ///
    /// Scans from the oldest end: the highest index whose timestamp beats
    /// the cursor fixes the count, and iteration walks back toward the
    /// newest entry.
    pub fn since(&self, cursor: SystemTime) -> std::iter::Rev<std::slice::Iter<'_, HistoryEntry>> {
        let count = self
            .entries
            .iter()
            .rposition(|entry| entry.time > cursor)
            .map_or(0, |i| i + 1);
        self.entries[..count].iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}
