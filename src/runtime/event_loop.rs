//! The readiness-driven event loop.
//!
//! Each iteration waits on poll, dispatches every fired event, then
//! compacts the connection table. Accepting, reading and framing, and
//! draining all happen here; command semantics live in the protocol
//! handler.

use std::io::{self, Read};
use std::net::SocketAddr;

use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::history::History;
use crate::limits::{BUF_CAP, MAX_CONN};
use crate::protocol::{self, handler};
use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{ConnTable, Connection};

const LISTENER: Token = Token(usize::MAX);
const LISTEN_BACKLOG: i32 = 128;

/// The running server: listener, poller, and all shared state.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    table: ConnTable,
    pool: BufferPool,
    history: History,
}

impl Server {
    /// Bind the listening socket and register it with the poller.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let mut listener = TcpListener::from_std(socket.into());
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            table: ConnTable::new(),
            pool: BufferPool::new(),
            history: History::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run forever. Returns only on a fatal condition; per-connection
    /// failures are absorbed by marking the offender closed.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(MAX_CONN);
        info!(addr = %self.local_addr()?, "listening");

        loop {
            trace!("waiting for readiness");
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_clients()?,
                    Token(idx) => self.handle_client_event(idx, event)?,
                }
            }

            self.table.compact(self.poll.registry(), &mut self.pool)?;
        }
    }

    /// Accept until would-block. A full table drops the fresh socket on
    /// the floor; accept failures are fatal.
    fn accept_clients(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.table.is_full() {
                        warn!(%peer, "connection table full, dropping client");
                        continue;
                    }
                    let idx = self.table.len();
                    self.poll
                        .registry()
                        .register(&mut stream, Token(idx), Interest::READABLE)?;
                    self.table.push(Connection::new(stream));
                    debug!(idx, %peer, "accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_client_event(&mut self, idx: usize, event: &Event) -> io::Result<()> {
        match self.table.get(idx) {
            Some(conn) if !conn.closed() => {}
            _ => return Ok(()),
        }

        if event.is_readable() {
            self.handle_readable(idx)?;
        }
        if event.is_writable() {
            self.handle_writable(idx)?;
        } else if event.is_error() {
            if let Some(conn) = self.table.get_mut(idx) {
                debug!(idx, "socket error, closing");
                conn.mark_closed();
            }
        }
        Ok(())
    }

    /// Read until would-block, framing after every read. Reading stops as
    /// soon as a response is pending: a connection with queued output is
    /// not read from.
    fn handle_readable(&mut self, idx: usize) -> io::Result<()> {
        loop {
            let Some(conn) = self.table.get_mut(idx) else {
                return Ok(());
            };
            if conn.closed() || conn.has_pending_output() {
                break;
            }
            let used = conn.input.used;
            match conn.stream.read(&mut conn.input.data[used..]) {
                Ok(0) => {
                    debug!(idx, "peer closed");
                    conn.mark_closed();
                    return Ok(());
                }
                Ok(n) => {
                    conn.input.used = used + n;
                    self.process_input(idx)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(idx, error = %e, "recv failed");
                    conn.mark_closed();
                    return Ok(());
                }
            }
        }

        let Some(conn) = self.table.get_mut(idx) else {
            return Ok(());
        };
        if !conn.closed() && conn.has_pending_output() {
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(idx), Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Frame and dispatch every complete line in the input buffer, then
    /// shift the unconsumed tail to the front. A saturated buffer with no
    /// terminator is an over-length line.
    fn process_input(&mut self, idx: usize) -> io::Result<()> {
        let mut begin = 0;
        loop {
            let Some(conn) = self.table.get(idx) else {
                return Ok(());
            };
            let data = &conn.input.data[begin..conn.input.used];
            let Some(pos) = protocol::find_crlf(data) else {
                break;
            };
            let line = data[..pos].to_vec();
            begin += pos + 2;
            trace!(idx, line = %String::from_utf8_lossy(&line), "request");
            handler::dispatch(&mut self.table, idx, &line, &mut self.pool, &mut self.history)?;
            if self.table.get(idx).is_some_and(|conn| conn.closed()) {
                return Ok(());
            }
        }

        let Some(conn) = self.table.get_mut(idx) else {
            return Ok(());
        };
        let used = conn.input.used;
        conn.input.data.copy_within(begin..used, 0);
        conn.input.used = used - begin;
        if conn.input.used == BUF_CAP {
            debug!(idx, "over-length line, closing");
            conn.mark_closed();
        }
        Ok(())
    }

    /// Drain the send queue; once empty, flip interest back to readable.
    fn handle_writable(&mut self, idx: usize) -> io::Result<()> {
        let Some(conn) = self.table.get_mut(idx) else {
            return Ok(());
        };
        if conn.closed() {
            return Ok(());
        }
        if conn.drain(&mut self.pool)? {
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(idx), Interest::READABLE)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    fn start_server() -> SocketAddr {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            log_level: "info".to_string(),
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());
        addr
    }

    struct Client {
        stream: TcpStream,
        reader: BufReader<TcpStream>,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let reader = BufReader::new(stream.try_clone().unwrap());
            Self { stream, reader }
        }

        fn request(&mut self, line: &str) {
            self.stream.write_all(line.as_bytes()).unwrap();
            self.stream.write_all(b"\r\n").unwrap();
        }

        /// One response line, terminator stripped; `None` on server close.
        fn response(&mut self) -> Option<String> {
            let mut line = String::new();
            match self.reader.read_line(&mut line).unwrap() {
                0 => None,
                _ => Some(line.trim_end().to_string()),
            }
        }
    }

    fn settle() {
        thread::sleep(Duration::from_millis(100));
    }

    fn assert_history_line(line: &str, rest: &str) {
        let bytes = line.as_bytes();
        assert_eq!(bytes[0], b'[', "bad prefix in {line:?}");
        assert_eq!(bytes[3], b':', "bad prefix in {line:?}");
        assert_eq!(bytes[6], b':', "bad prefix in {line:?}");
        assert_eq!(bytes[9], b']', "bad prefix in {line:?}");
        assert_eq!(&line[10..], format!(" {rest}"), "bad payload in {line:?}");
    }

    #[test]
    fn test_naming() {
        let addr = start_server();
        let mut client = Client::connect(addr);

        client.request("my name is alice");
        assert_eq!(client.response().as_deref(), Some("ok"));
    }

    #[test]
    fn test_roster() {
        let addr = start_server();
        let mut a = Client::connect(addr);
        let mut b = Client::connect(addr);
        let mut c = Client::connect(addr);

        for (client, name) in [(&mut a, "a"), (&mut b, "b"), (&mut c, "c")] {
            client.request(&format!("my name is {name}"));
            assert_eq!(client.response().as_deref(), Some("ok"));
        }

        c.request("folks");
        assert_eq!(c.response().as_deref(), Some("3"));
        let mut names: Vec<String> = (0..3).map(|_| c.response().unwrap()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_broadcast_and_poll() {
        let addr = start_server();
        let mut b = Client::connect(addr);
        settle(); // b's cursor must predate a's message

        let mut a = Client::connect(addr);
        a.request("my name is a");
        assert_eq!(a.response().as_deref(), Some("ok"));
        a.request("send hello");
        assert_eq!(a.response().as_deref(), Some("ok"));

        b.request("new");
        assert_eq!(b.response().as_deref(), Some("1"));
        assert_history_line(&b.response().unwrap(), "a: hello");

        b.request("new");
        assert_eq!(b.response().as_deref(), Some("0"));
    }

    #[test]
    fn test_new_is_oldest_first() {
        let addr = start_server();
        let mut b = Client::connect(addr);
        settle();

        let mut a = Client::connect(addr);
        a.request("my name is a");
        assert_eq!(a.response().as_deref(), Some("ok"));
        for body in ["one", "two"] {
            a.request(&format!("send {body}"));
            assert_eq!(a.response().as_deref(), Some("ok"));
        }

        b.request("new");
        assert_eq!(b.response().as_deref(), Some("2"));
        assert_history_line(&b.response().unwrap(), "a: one");
        assert_history_line(&b.response().unwrap(), "a: two");
    }

    #[test]
    fn test_two_polls_with_no_sends() {
        let addr = start_server();
        let mut client = Client::connect(addr);

        client.request("new");
        assert_eq!(client.response().as_deref(), Some("0"));
        client.request("new");
        assert_eq!(client.response().as_deref(), Some("0"));
    }

    #[test]
    fn test_overlong_message_closes() {
        let addr = start_server();
        let mut client = Client::connect(addr);

        let body = "x".repeat(141);
        client.request(&format!("send {body}"));
        // no ok, just a closed connection
        assert_eq!(client.response(), None);
    }

    #[test]
    fn test_message_boundary_accepted() {
        let addr = start_server();
        let mut client = Client::connect(addr);

        let body = "x".repeat(140);
        client.request(&format!("send {body}"));
        assert_eq!(client.response().as_deref(), Some("ok"));
    }

    #[test]
    fn test_nick_boundary() {
        let addr = start_server();

        let mut fits = Client::connect(addr);
        fits.request(&format!("my name is {}", "n".repeat(20)));
        assert_eq!(fits.response().as_deref(), Some("ok"));

        let mut too_long = Client::connect(addr);
        too_long.request(&format!("my name is {}", "n".repeat(21)));
        assert_eq!(too_long.response(), None);
    }

    #[test]
    fn test_unknown_command_closes() {
        let addr = start_server();
        let mut client = Client::connect(addr);

        client.request("foo");
        assert_eq!(client.response(), None);
    }

    #[test]
    fn test_partial_line_reassembly() {
        let addr = start_server();
        let mut client = Client::connect(addr);

        client.stream.write_all(b"my name is al").unwrap();
        client.stream.flush().unwrap();
        settle();
        client.stream.write_all(b"ice\r\n").unwrap();
        assert_eq!(client.response().as_deref(), Some("ok"));
    }

    #[test]
    fn test_input_overflow_closes() {
        let addr = start_server();
        let mut client = Client::connect(addr);

        // an unterminated line one byte short of capacity must still buffer
        let almost = vec![b'x'; BUF_CAP - 1];
        client.stream.write_all(&almost).unwrap();
        settle();

        // saturating the buffer without a terminator closes the connection
        client.stream.write_all(b"x").unwrap();
        assert_eq!(client.response(), None);
    }

    #[test]
    fn test_roster_after_disconnect() {
        let addr = start_server();
        let mut a = Client::connect(addr);
        let mut b = Client::connect(addr);
        let c = Client::connect(addr);

        for (client, name) in [(&mut a, "a"), (&mut b, "b")] {
            client.request(&format!("my name is {name}"));
            assert_eq!(client.response().as_deref(), Some("ok"));
        }
        settle();

        drop(c);
        settle(); // let the reap run before asking for the roster

        // both survivors still work after the table moved them around
        a.request("folks");
        assert_eq!(a.response().as_deref(), Some("2"));
        let mut names: Vec<String> = (0..2).map(|_| a.response().unwrap()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        b.request("send still here");
        assert_eq!(b.response().as_deref(), Some("ok"));
    }

    #[test]
    fn test_pipelined_requests() {
        let addr = start_server();
        let mut client = Client::connect(addr);

        // several requests in one segment are all answered, in order
        client
            .stream
            .write_all(b"my name is ada\r\nsend hi\r\nfolks\r\n")
            .unwrap();
        assert_eq!(client.response().as_deref(), Some("ok"));
        assert_eq!(client.response().as_deref(), Some("ok"));
        assert_eq!(client.response().as_deref(), Some("1"));
        assert_eq!(client.response().as_deref(), Some("ada"));
    }
}
