//! Wire protocol: line framing and request recognition.
//!
//! Requests and responses are `\r\n`-terminated lines. Matching is purely
//! byte-oriented; payloads pass through without charset decoding. The two
//! prefixed commands match literally, trailing space included.

pub mod handler;

pub const PREFIX_SET_NICK: &[u8] = b"my name is ";
pub const PREFIX_SEND: &[u8] = b"send ";
pub const CMD_FOLKS: &[u8] = b"folks";
pub const CMD_NEW: &[u8] = b"new";
pub const RESP_OK: &[u8] = b"ok";
pub const CRLF: &[u8] = b"\r\n";

/// A recognized request line. Payload slices borrow from the input line.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    /// `my name is <nick>`
    SetNick(&'a [u8]),
    /// `folks`
    Folks,
    /// `send <msg>`
    Send(&'a [u8]),
    /// `new`
    New,
}

/// Recognize one request line. `None` means an unknown command, which
/// costs the sender its connection.
pub fn parse(line: &[u8]) -> Option<Command<'_>> {
    if let Some(nick) = line.strip_prefix(PREFIX_SET_NICK) {
        Some(Command::SetNick(nick))
    } else if line == CMD_FOLKS {
        Some(Command::Folks)
    } else if let Some(body) = line.strip_prefix(PREFIX_SEND) {
        Some(Command::Send(body))
    } else if line == CMD_NEW {
        Some(Command::New)
    } else {
        None
    }
}

/// Find `\r\n` in `buffer`, returning the position of the `\r`.
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}
