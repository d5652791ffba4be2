//! One connection to one cache server.
//!
//! A connection owns exactly one socket plus its receive buffer and
//! in-flight bookkeeping. Requests are blocking: write one frame, read until
//! the frame answering it arrives or the socket times out. Network failures
//! are retried in place up to `socket_max_failures`, after which the server
//! is marked down for `down_retry_delay` and the ring routes around it.
//!
//! Pipelined multi-get uses a different shape: `send_multiget` writes quiet
//! gets terminated by a NOOP without reading, and the coordinator drains all
//! participating sockets through `multi_response_nonblock` under readiness
//! multiplexing.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use memring_wire::{request, Opcode, Response, Status};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use socket2::SockRef;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::servers::{ServerAddress, ServerDescriptor};

const READ_CHUNK: usize = 8 * 1024;

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Unconnected,
    Connecting,
    Authenticating,
    Ready,
    Down { until: Instant },
    Closed,
}

/// Operations dispatched over a connection.
pub(crate) enum Op<'a> {
    Get { key: &'a str },
    Store { opcode: Opcode, key: &'a str, value: &'a [u8], flags: u32, expiry: u32, cas: u64 },
    Delete { opcode: Opcode, key: &'a str, cas: u64 },
    Counter { opcode: Opcode, key: &'a str, delta: u64, initial: Option<u64>, expiry: u32 },
    Concat { opcode: Opcode, key: &'a str, value: &'a [u8] },
    Touch { key: &'a str, expiry: u32 },
    Gat { key: &'a str, expiry: u32 },
    Flush { delay: u32 },
    Version,
}

impl Op<'_> {
    fn encode(&self, buf: &mut BytesMut, opaque: u32) {
        match self {
            Op::Get { key } => request::get(buf, key.as_bytes(), opaque),
            Op::Store { opcode, key, value, flags, expiry, cas } => {
                request::store(buf, *opcode, key.as_bytes(), value, *flags, *expiry, *cas, opaque)
            }
            Op::Delete { opcode, key, cas } => {
                request::delete(buf, *opcode, key.as_bytes(), *cas, opaque)
            }
            Op::Counter { opcode, key, delta, initial, expiry } => {
                request::counter(buf, *opcode, key.as_bytes(), *delta, *initial, *expiry, opaque)
            }
            Op::Concat { opcode, key, value } => {
                request::concat(buf, *opcode, key.as_bytes(), value, opaque)
            }
            Op::Touch { key, expiry } => request::touch(buf, key.as_bytes(), *expiry, opaque),
            Op::Gat { key, expiry } => request::gat(buf, key.as_bytes(), *expiry, opaque),
            Op::Flush { delay } => request::flush(buf, *delay, opaque),
            Op::Version => request::version(buf, opaque),
        }
    }

    pub(crate) fn key(&self) -> Option<&str> {
        match self {
            Op::Get { key }
            | Op::Store { key, .. }
            | Op::Delete { key, .. }
            | Op::Counter { key, .. }
            | Op::Concat { key, .. }
            | Op::Touch { key, .. }
            | Op::Gat { key, .. } => Some(key),
            Op::Flush { .. } | Op::Version => None,
        }
    }
}

enum Transport {
    Tcp(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
    Unix(UnixStream),
}

impl Transport {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.set_nonblocking(nonblocking),
            Transport::Tls(s) => s.sock.set_nonblocking(nonblocking),
            Transport::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Transport::Tcp(s) => s.as_raw_fd(),
            Transport::Tls(s) => s.sock.as_raw_fd(),
            Transport::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
            Transport::Unix(s) => s.flush(),
        }
    }
}

struct Stream {
    transport: Transport,
    recv: BytesMut,
}

/// Bookkeeping for one in-flight pipelined multi-get.
struct MultiState {
    /// opaque -> normalized key, so responses re-associate without key echo.
    pending: HashMap<u32, String>,
    /// Opaque of the terminating NOOP.
    terminator: u32,
    completed: bool,
}

pub(crate) struct Connection {
    name: String,
    descriptor: ServerDescriptor,
    config: Arc<ClientConfig>,
    state: ConnectionState,
    stream: Option<Stream>,
    opaque: u32,
    failures: u32,
    multi: Option<MultiState>,
    /// opaque -> key for quiet writes inside a pipeline scope.
    quiet: HashMap<u32, String>,
}

impl Connection {
    pub fn new(descriptor: ServerDescriptor, config: Arc<ClientConfig>) -> Self {
        Connection {
            name: descriptor.name(),
            descriptor,
            config,
            state: ConnectionState::Unconnected,
            stream: None,
            opaque: 0,
            failures: 0,
            multi: None,
            quiet: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A server is alive unless closed or inside its down window.
    pub fn alive(&self) -> bool {
        match self.state {
            ConnectionState::Down { until } => Instant::now() >= until,
            ConnectionState::Closed => false,
            _ => true,
        }
    }

    /// Terminal close; the ring replaces this instance on reset.
    pub fn close(&mut self) {
        self.stream = None;
        self.multi = None;
        self.quiet.clear();
        self.state = ConnectionState::Closed;
    }

    fn next_opaque(&mut self) -> u32 {
        self.opaque = self.opaque.wrapping_add(1);
        if self.opaque == 0 {
            self.opaque = 1;
        }
        self.opaque
    }

    // -- Dispatch ------------------------------------------------------------

    /// Send one request and block for its response.
    ///
    /// Network failures retry in place, separated by `socket_failure_delay`;
    /// `socket_max_failures` of them mark the server down and propagate.
    pub fn request(&mut self, op: &Op<'_>) -> Result<Response> {
        match self.state {
            ConnectionState::Closed => {
                return Err(Error::network(&self.name, "connection closed"));
            }
            ConnectionState::Down { until } if Instant::now() < until => {
                return Err(Error::network(&self.name, "server is marked down"));
            }
            _ => {}
        }

        loop {
            match self.try_request(op) {
                Ok(resp) => {
                    self.failures = 0;
                    return Ok(resp);
                }
                Err(err) if err.is_network() => {
                    self.teardown();
                    self.failures += 1;
                    if self.failures >= self.config.socket_max_failures {
                        self.mark_down(&err);
                        return Err(err);
                    }
                    debug!(server = %self.name, key = op.key(), error = %err, "retrying request");
                    thread::sleep(self.config.socket_failure_delay);
                }
                Err(err) => {
                    // A corrupt stream cannot be resynchronized.
                    self.teardown();
                    return Err(err);
                }
            }
        }
    }

    fn try_request(&mut self, op: &Op<'_>) -> Result<Response> {
        self.ensure_ready()?;
        let opaque = self.next_opaque();
        let mut buf = BytesMut::new();
        op.encode(&mut buf, opaque);
        self.write_all(&buf)?;
        self.read_response(opaque)
    }

    fn teardown(&mut self) {
        self.stream = None;
        self.multi = None;
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Unconnected;
        }
    }

    fn mark_down(&mut self, err: &Error) {
        let until = Instant::now() + self.config.down_retry_delay;
        warn!(
            server = %self.name,
            retry_in = ?self.config.down_retry_delay,
            error = %err,
            "marking server down"
        );
        self.state = ConnectionState::Down { until };
        self.failures = 0;
    }

    /// Failure accounting for paths without the in-place retry loop
    /// (multi-get sends, pipeline writes).
    fn note_failure(&mut self, err: &Error) {
        self.teardown();
        self.failures += 1;
        if self.failures >= self.config.socket_max_failures {
            self.mark_down(err);
        }
    }

    // -- Connect / handshake -------------------------------------------------

    fn ensure_ready(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Closed => {
                return Err(Error::network(&self.name, "connection closed"));
            }
            ConnectionState::Down { until } => {
                if Instant::now() < until {
                    return Err(Error::network(&self.name, "server is marked down"));
                }
                self.state = ConnectionState::Unconnected;
            }
            _ => {}
        }
        self.connect()
    }

    fn connect(&mut self) -> Result<()> {
        self.state = ConnectionState::Connecting;
        let transport = match self.open_transport() {
            Ok(t) => t,
            Err(err) => {
                self.state = ConnectionState::Unconnected;
                return Err(err);
            }
        };
        self.stream = Some(Stream {
            transport,
            recv: BytesMut::with_capacity(READ_CHUNK),
        });

        let creds = self.credentials();
        if let Some((username, password)) = creds {
            self.state = ConnectionState::Authenticating;
            if let Err(err) = self.authenticate(&username, &password) {
                // Bad credentials will not get better on the next attempt;
                // take the whole down window before retrying.
                self.teardown();
                self.mark_down(&err);
                return Err(err);
            }
        }

        self.state = ConnectionState::Ready;
        Ok(())
    }

    fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .descriptor
            .username
            .clone()
            .or_else(|| self.config.username.clone())?;
        let password = self
            .descriptor
            .password
            .clone()
            .or_else(|| self.config.password.clone())
            .unwrap_or_default();
        Some((username, password))
    }

    fn open_transport(&self) -> Result<Transport> {
        let timeout = self.config.socket_timeout;
        match &self.descriptor.address {
            ServerAddress::Tcp { host, port } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(|e| Error::network_io(&self.name, &e))?
                    .next()
                    .ok_or_else(|| Error::network(&self.name, "hostname resolved to nothing"))?;
                let tcp = TcpStream::connect_timeout(&addr, timeout)
                    .map_err(|e| Error::network_io(&self.name, &e))?;
                self.apply_socket_options(&tcp)
                    .map_err(|e| Error::network_io(&self.name, &e))?;

                match &self.config.tls {
                    Some(tls) => {
                        let server_name = ServerName::try_from(host.clone()).map_err(|_| {
                            Error::InvalidArgument(format!("invalid TLS server name: {host}"))
                        })?;
                        let conn = ClientConnection::new(tls.clone(), server_name)
                            .map_err(|e| Error::network(&self.name, e.to_string()))?;
                        Ok(Transport::Tls(Box::new(StreamOwned::new(conn, tcp))))
                    }
                    None => Ok(Transport::Tcp(tcp)),
                }
            }
            ServerAddress::Unix { path } => {
                let sock =
                    UnixStream::connect(path).map_err(|e| Error::network_io(&self.name, &e))?;
                sock.set_read_timeout(Some(timeout))
                    .and_then(|_| sock.set_write_timeout(Some(timeout)))
                    .map_err(|e| Error::network_io(&self.name, &e))?;
                Ok(Transport::Unix(sock))
            }
        }
    }

    fn apply_socket_options(&self, tcp: &TcpStream) -> io::Result<()> {
        let timeout = self.config.socket_timeout;
        tcp.set_nodelay(true)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let sock = SockRef::from(tcp);
        if self.config.keepalive {
            sock.set_keepalive(true)?;
        }
        if let Some(bytes) = self.config.sndbuf {
            sock.set_send_buffer_size(bytes)?;
        }
        if let Some(bytes) = self.config.rcvbuf {
            sock.set_recv_buffer_size(bytes)?;
        }
        Ok(())
    }

    fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let opaque = self.next_opaque();
        let mut buf = BytesMut::new();
        request::sasl_auth(&mut buf, username, password, opaque);
        self.write_all(&buf)?;
        let resp = self.read_response(opaque)?;
        match resp.status {
            Status::NoError => Ok(()),
            Status::AuthContinue => Err(Error::network(
                &self.name,
                "server requested SASL continuation; only PLAIN is supported",
            )),
            status => Err(Error::network(
                &self.name,
                format!("authentication failed: {}", status.as_str()),
            )),
        }
    }

    // -- Framed IO -----------------------------------------------------------

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let Connection { name, stream, .. } = self;
        let stream = stream
            .as_mut()
            .ok_or_else(|| Error::network(&*name, "not connected"))?;
        stream
            .transport
            .write_all(buf)
            .and_then(|_| stream.transport.flush())
            .map_err(|e| match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    Error::network(&*name, "write timed out")
                }
                _ => Error::network_io(&*name, &e),
            })
    }

    /// Read one frame, blocking until a whole one is buffered.
    fn read_frame(&mut self) -> Result<Response> {
        let Connection { name, stream, .. } = self;
        let stream = stream
            .as_mut()
            .ok_or_else(|| Error::network(&*name, "not connected"))?;
        loop {
            if let Some((resp, used)) = Response::parse(&stream.recv)? {
                stream.recv.advance(used);
                return Ok(resp);
            }
            let mut chunk = [0u8; READ_CHUNK];
            match stream.transport.read(&mut chunk) {
                Ok(0) => return Err(Error::network(&*name, "connection closed by server")),
                Ok(n) => stream.recv.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(Error::network(&*name, "read timed out"));
                }
                Err(e) => return Err(Error::network_io(&*name, &e)),
            }
        }
    }

    /// Read frames until the one answering `expected` arrives. Stale frames
    /// (e.g. error responses to quiet writes) are logged and dropped.
    fn read_response(&mut self, expected: u32) -> Result<Response> {
        loop {
            let resp = self.read_frame()?;
            if resp.opaque == expected {
                return Ok(resp);
            }
            debug!(
                server = %self.name,
                opaque = resp.opaque,
                opcode = ?resp.opcode,
                "discarding stale response frame"
            );
        }
    }

    // -- Fan-out helpers -----------------------------------------------------

    /// STAT: one request, many response frames, empty-key terminator.
    pub fn stats(&mut self, group: Option<&str>) -> Result<Vec<(String, String)>> {
        self.ensure_ready()?;
        let opaque = self.next_opaque();
        let mut buf = BytesMut::new();
        request::stat(&mut buf, group.map(str::as_bytes), opaque);
        if let Err(err) = self.write_all(&buf) {
            self.note_failure(&err);
            return Err(err);
        }

        let mut entries = Vec::new();
        loop {
            let resp = match self.read_response(opaque) {
                Ok(resp) => resp,
                Err(err) => {
                    if err.is_network() {
                        self.note_failure(&err);
                    }
                    return Err(err);
                }
            };
            if !resp.is_success() {
                return Err(Error::Protocol(format!(
                    "stats failed: {}",
                    resp.status.as_str()
                )));
            }
            if resp.is_stat_end() {
                return Ok(entries);
            }
            entries.push((
                String::from_utf8_lossy(&resp.key).into_owned(),
                String::from_utf8_lossy(&resp.value).into_owned(),
            ));
        }
    }

    // -- Pipelined multi-get -------------------------------------------------

    /// Write one GETQ per key plus a terminating NOOP; reads nothing.
    pub fn send_multiget(&mut self, keys: &[String]) -> Result<()> {
        self.ensure_ready()?;
        let mut buf = BytesMut::new();
        let mut pending = HashMap::with_capacity(keys.len());
        for key in keys {
            let opaque = self.next_opaque();
            request::getq(&mut buf, key.as_bytes(), opaque);
            pending.insert(opaque, key.clone());
        }
        let terminator = self.next_opaque();
        request::noop(&mut buf, terminator);

        if let Err(err) = self.write_all(&buf) {
            self.note_failure(&err);
            return Err(err);
        }
        self.multi = Some(MultiState {
            pending,
            terminator,
            completed: false,
        });
        Ok(())
    }

    /// Switch the socket to non-blocking for the drain loop.
    pub fn multi_response_start(&mut self) -> Result<()> {
        self.set_nonblocking(true)
    }

    /// Parse whatever is immediately available. Emits `(key, response)` for
    /// each pipelined hit; returns once the socket would block.
    pub fn multi_response_nonblock(
        &mut self,
        emit: &mut dyn FnMut(&str, Response),
    ) -> Result<()> {
        let Connection {
            name,
            stream,
            multi,
            ..
        } = self;
        let stream = stream
            .as_mut()
            .ok_or_else(|| Error::network(&*name, "not connected"))?;
        let multi = multi
            .as_mut()
            .ok_or_else(|| Error::Protocol("no multi-get in flight".into()))?;

        loop {
            while let Some((resp, used)) = Response::parse(&stream.recv)? {
                stream.recv.advance(used);
                match resp.opcode {
                    Opcode::Noop if resp.opaque == multi.terminator => {
                        multi.completed = true;
                    }
                    Opcode::GetQ => match multi.pending.remove(&resp.opaque) {
                        Some(key) if resp.is_success() => emit(&key, resp),
                        Some(key) => warn!(
                            server = %name,
                            key = %key,
                            status = resp.status.as_str(),
                            "dropping pipelined get"
                        ),
                        None => debug!(server = %name, "pipelined get with unknown opaque"),
                    },
                    _ => debug!(
                        server = %name,
                        opcode = ?resp.opcode,
                        "unexpected frame during multi-get drain"
                    ),
                }
            }
            if multi.completed {
                return Ok(());
            }

            let mut chunk = [0u8; READ_CHUNK];
            match stream.transport.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::network(&*name, "connection closed during multi-get"))
                }
                Ok(n) => stream.recv.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(Error::network_io(&*name, &e)),
            }
        }
    }

    /// True once the terminating NOOP response has been observed.
    pub fn multi_response_completed(&self) -> bool {
        self.multi.as_ref().is_some_and(|m| m.completed)
    }

    /// Clean finish: back to blocking mode, bookkeeping dropped. Leftover
    /// buffered bytes would be stale frames, so they are discarded too.
    pub fn multi_response_finish(&mut self) -> Result<()> {
        self.multi = None;
        if let Some(stream) = &mut self.stream {
            stream.recv.clear();
        }
        self.set_nonblocking(false)
    }

    /// Abort: discard buffered bytes, close the socket, go Unconnected.
    pub fn multi_response_abort(&mut self) {
        self.multi = None;
        self.teardown();
    }

    pub(crate) fn registered_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.transport.raw_fd())
    }

    /// Borrowed fd for poller re-arm/delete. Caller holds the connection
    /// lock, so the fd stays open for the borrow's lifetime.
    pub(crate) fn borrowed_fd(&self) -> Option<BorrowedFd<'_>> {
        self.stream
            .as_ref()
            .map(|s| unsafe { BorrowedFd::borrow_raw(s.transport.raw_fd()) })
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        let Connection { name, stream, .. } = self;
        let stream = stream
            .as_mut()
            .ok_or_else(|| Error::network(&*name, "not connected"))?;
        stream
            .transport
            .set_nonblocking(nonblocking)
            .map_err(|e| Error::network_io(&*name, &e))
    }

    // -- Quiet-write pipeline ------------------------------------------------

    /// Send one quiet operation; no response is read until
    /// [`pipeline_finish`](Self::pipeline_finish).
    pub fn pipeline_op(&mut self, op: &Op<'_>) -> Result<()> {
        self.ensure_ready()?;
        let opaque = self.next_opaque();
        let mut buf = BytesMut::new();
        op.encode(&mut buf, opaque);
        if let Err(err) = self.write_all(&buf) {
            self.note_failure(&err);
            return Err(err);
        }
        self.quiet
            .insert(opaque, op.key().unwrap_or_default().to_string());
        Ok(())
    }

    /// Terminate the quiet batch with a NOOP and drain error responses.
    /// Quiet failures are logged, not raised; the scope is fire-and-forget.
    pub fn pipeline_finish(&mut self) -> Result<()> {
        if self.quiet.is_empty() {
            return Ok(());
        }

        let opaque = self.next_opaque();
        let mut buf = BytesMut::new();
        request::noop(&mut buf, opaque);
        let result = self.write_all(&buf).and_then(|_| loop {
            let resp = self.read_frame()?;
            if resp.opaque == opaque {
                break Ok(());
            }
            match self.quiet.remove(&resp.opaque) {
                Some(key) if !resp.is_success() => warn!(
                    server = %self.name,
                    key = %key,
                    status = resp.status.as_str(),
                    "quiet write failed"
                ),
                Some(_) => {}
                None => debug!(server = %self.name, "stale frame while draining pipeline"),
            }
        });

        self.quiet.clear();
        if let Err(err) = &result {
            if err.is_network() {
                self.note_failure(err);
            }
        }
        result
    }
}
