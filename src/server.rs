use std::io::{self, Read, Write};
use std::cmp;
use std::net::{Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use http::{Method, StatusCode};
use libc;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use mio::net::{TcpListener, TcpStream};
use num_cpus;
use slab::Slab;
use threadpool::ThreadPool;

use {Request, Response};
use errors::*;
use http_stream::{HttpStreamReader, Limits};
use response;


const LISTENER: Token = Token(::std::usize::MAX - 1);
const NOTIFY: Token = Token(::std::usize::MAX - 2);

/// Most bytes read off one socket before trying to parse them
const READ_BUDGET: usize = 64 * 1024;

/// Most bytes discarded from a rejected client before hanging up on it
const DRAIN_LIMIT: usize = 16 << 20;

/// Bounds of the pause between accept attempts while out of descriptors
const MIN_ACCEPT_BACKOFF_MS: u64 = 5;
const MAX_ACCEPT_BACKOFF_MS: u64 = 1000;


type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync + 'static>;


/// A bound, not yet serving, HTTP server.
///
/// Every request, whatever its method or path, is handed to the one
/// handler passed to `serve`.
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    workers: usize,
    limits: Limits,
}
impl Server {
    /// Bind a listener on `addr`. This is where "address in use"
    /// and friends show up.
    pub fn bind(addr: &str) -> Result<Server> {
        let addr: SocketAddr = addr.parse()?;
        let listener = TcpListener::bind(&addr)?;
        let addr = listener.local_addr()?;
        Ok(Server {
            listener,
            addr,
            workers: num_cpus::get(),
            limits: Limits::default(),
        })
    }

    /// Number of threads running the handler
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = cmp::max(n, 1);
        self
    }

    pub fn max_header_bytes(mut self, n: usize) -> Self {
        self.limits.max_header_bytes = n;
        self
    }

    pub fn max_body_bytes(mut self, n: usize) -> Self {
        self.limits.max_body_bytes = n;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept and answer connections until something fatal happens
    pub fn serve<F>(self, handler: F) -> Result<()>
        where F: Fn(&Request) -> Response + Send + Sync + 'static
    {
        let poll = Poll::new()?;
        poll.register(&self.listener, LISTENER, Ready::readable(), PollOpt::edge())?;
        let (registration, notifier) = Registration::new2();
        poll.register(&registration, NOTIFY, Ready::readable(), PollOpt::edge())?;
        let (sender, receiver) = mpsc::channel();

        let mut event_loop = EventLoop {
            poll,
            listener: self.listener,
            _registration: registration,
            notifier,
            sender,
            receiver,
            pool: ThreadPool::with_name("sample-app-worker".into(), self.workers),
            handler: Arc::new(handler),
            connections: Slab::with_capacity(1024),
            next_serial: 0,
            limits: self.limits,
            accept_backoff: None,
            retry_accept_at: None,
        };
        info!("** Listening on {} **", self.addr);
        event_loop.run()
    }
}


/// A handler's answer, on its way back to the poll thread
struct Completed {
    token: Token,
    serial: u64,
    bytes: Vec<u8>,
    keep_alive: bool,
}


struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    _registration: Registration,
    notifier: SetReadiness,
    sender: Sender<Completed>,
    receiver: Receiver<Completed>,
    pool: ThreadPool,
    handler: Handler,
    connections: Slab<Connection>,
    next_serial: u64,
    limits: Limits,
    /// Set while accepting is paused for lack of descriptors
    accept_backoff: Option<Duration>,
    retry_accept_at: Option<Instant>,
}
impl EventLoop {
    fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            let timeout = self.retry_accept_at.map(|at| at.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut events, timeout) {
                Ok(_) => (),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept()?,
                    NOTIFY => self.deliver()?,
                    token => self.ready(token),
                }
            }
            // the listener is edge-triggered, so a paused backlog only gets retried here
            if let Some(at) = self.retry_accept_at {
                if Instant::now() >= at {
                    self.retry_accept_at = None;
                    self.accept()?;
                }
            }
        }
    }

    /// Drain the listener's backlog
    fn accept(&mut self) -> Result<()> {
        if self.retry_accept_at.is_some() { return Ok(()) }
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if is_resource_exhausted(e) => {
                    let backoff = match self.accept_backoff {
                        Some(prev) => cmp::min(prev * 2, Duration::from_millis(MAX_ACCEPT_BACKOFF_MS)),
                        None => Duration::from_millis(MIN_ACCEPT_BACKOFF_MS),
                    };
                    warn!("accept error: {}; retrying in {:?}", e, backoff);
                    self.accept_backoff = Some(backoff);
                    self.retry_accept_at = Some(Instant::now() + backoff);
                    return Ok(())
                }
                Err(ref e) if is_transient(e) => {
                    debug!("dropped incoming connection: {}", e);
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            self.accept_backoff = None;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {}: {}", peer, e);
            }
            let serial = self.next_serial;
            self.next_serial += 1;
            let entry = self.connections.vacant_entry();
            let token = Token(entry.key());
            self.poll.register(&stream, token,
                               Ready::readable() | Ready::writable(),
                               PollOpt::edge())?;
            debug!("opened socket to {} as {:?}", peer, token);
            entry.insert(Connection::new(stream, peer, serial, self.limits));
        }
    }

    /// Socket activity on a connection
    fn ready(&mut self, token: Token) {
        let action = match self.connections.get_mut(token.0) {
            Some(conn) => conn.advance(),
            None => return,
        };
        self.apply(token, action);
    }

    /// Hand finished responses back to their connections
    fn deliver(&mut self) -> Result<()> {
        // reset before draining so a send racing with us raises a fresh event
        self.notifier.set_readiness(Ready::empty())?;
        while let Ok(done) = self.receiver.try_recv() {
            let action = match self.connections.get_mut(done.token.0) {
                Some(conn) if conn.serial == done.serial => {
                    conn.queue_response(done.bytes, done.keep_alive);
                    conn.advance()
                }
                _ => {
                    debug!("discarding response for closed connection {:?}", done.token);
                    continue
                }
            };
            self.apply(done.token, action);
        }
        Ok(())
    }

    fn apply(&mut self, token: Token, action: Action) {
        match action {
            Action::Idle => (),
            Action::Close => self.close(token),
            Action::Dispatch(request) => self.dispatch(token, request),
        }
    }

    fn close(&mut self, token: Token) {
        if !self.connections.contains(token.0) { return }
        let conn = self.connections.remove(token.0);
        if let Err(e) = self.poll.deregister(&conn.stream) {
            debug!("deregister {:?} failed: {}", token, e);
        }
        debug!("closed socket to {} ({:?})", conn.peer, token);
    }

    /// Run the handler for `request` on the worker pool
    fn dispatch(&mut self, token: Token, request: Request) {
        let serial = match self.connections.get(token.0) {
            Some(conn) => conn.serial,
            None => return,
        };
        debug!("{} {} from {:?}", request.method(), request.uri(), token);
        let handler = self.handler.clone();
        let sender = self.sender.clone();
        let notifier = self.notifier.clone();
        self.pool.execute(move || {
            let head_only = *request.method() == Method::HEAD;
            let version = request.version();
            let response = match panic::catch_unwind(AssertUnwindSafe(|| handler(&request))) {
                Ok(response) => response,
                Err(_) => {
                    error!("handler panicked on {} {}", request.method(), request.uri());
                    internal_error()
                }
            };
            let keep_alive = response::wants_keep_alive(&request)
                && !response::has_connection_token(response.headers(), "close");
            let bytes = response::serialize(&response, version, head_only, keep_alive);
            if sender.send(Completed { token, serial, bytes, keep_alive }).is_ok() {
                if let Err(e) = notifier.set_readiness(Ready::readable()) {
                    error!("failed to wake event loop: {}", e);
                }
            }
        });
    }
}


fn internal_error() -> Response {
    let mut response = Response::new(b"500 Internal Server Error".to_vec());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}


/// Accept errors that only concern the one connection being accepted
fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::Interrupted |
        io::ErrorKind::ConnectionAborted |
        io::ErrorKind::ConnectionReset => true,
        _ => false,
    }
}


/// Accept errors caused by running short of descriptors or memory.
/// Connections keep waiting in the backlog until some are freed.
fn is_resource_exhausted(e: &io::Error) -> bool {
    match e.raw_os_error() {
        Some(code) => code == libc::EMFILE || code == libc::ENFILE
            || code == libc::ENOBUFS || code == libc::ENOMEM,
        None => false,
    }
}


/// What the event loop should do with a connection after advancing it
enum Action {
    Idle,
    Close,
    Dispatch(Request),
}


enum Phase {
    /// Collecting the next request
    Reading,
    /// A request is with the handler
    Waiting,
    /// Flushing a response; afterwards read again or close
    Responding { keep_alive: bool },
    /// Flushing a rejection, after which our side shuts down
    Rejecting,
    /// Write side shut; reading and dropping what the client still sends
    /// so closing doesn't reset the connection under the rejection
    Draining { discarded: usize },
}


struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    serial: u64,
    reader: HttpStreamReader,
    phase: Phase,
    write_buf: Vec<u8>,
    bytes_written: usize,
    read_closed: bool,
}
impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, serial: u64, limits: Limits) -> Self {
        Connection {
            stream,
            peer,
            serial,
            reader: HttpStreamReader::new(limits),
            phase: Phase::Reading,
            write_buf: Vec::with_capacity(1024),
            bytes_written: 0,
            read_closed: false,
        }
    }

    fn queue_response(&mut self, bytes: Vec<u8>, keep_alive: bool) {
        self.write_buf.extend_from_slice(&bytes);
        self.phase = Phase::Responding { keep_alive };
    }

    /// Make as much progress as the socket allows without blocking
    fn advance(&mut self) -> Action {
        loop {
            if let Err(e) = self.flush() {
                debug!("write to {} failed: {}", self.peer, e);
                return Action::Close
            }
            match self.phase {
                Phase::Waiting => return Action::Idle,
                Phase::Responding { keep_alive } => {
                    if !self.write_buf.is_empty() { return Action::Idle }
                    if !keep_alive || self.read_closed { return Action::Close }
                    self.phase = Phase::Reading;
                }
                Phase::Rejecting => {
                    if !self.write_buf.is_empty() { return Action::Idle }
                    if self.read_closed { return Action::Close }
                    if let Err(e) = self.stream.shutdown(Shutdown::Write) {
                        debug!("shutdown of {} failed: {}", self.peer, e);
                        return Action::Close
                    }
                    self.phase = Phase::Draining { discarded: 0 };
                }
                Phase::Draining { discarded } => return self.drain(discarded),
                Phase::Reading => {
                    let drained = match self.fill() {
                        Ok(drained) => drained,
                        Err(e) => {
                            debug!("read from {} failed: {}", self.peer, e);
                            return Action::Close
                        }
                    };
                    match self.reader.try_build_request() {
                        Ok(Some(request)) => {
                            self.phase = Phase::Waiting;
                            return Action::Dispatch(request)
                        }
                        Ok(None) => {
                            if self.read_closed { return Action::Close }
                            if self.reader.take_continue() {
                                self.write_buf.extend_from_slice(response::CONTINUE);
                                continue
                            }
                            if drained { return Action::Idle }
                        }
                        Err(e) => {
                            let status = match e.response_status() {
                                Some(status) => status,
                                None => return Action::Close,
                            };
                            warn!("rejecting request from {} with {}: {}", self.peer, status, e);
                            self.write_buf.extend_from_slice(&response::error_response(status));
                            self.phase = Phase::Rejecting;
                        }
                    }
                }
            }
        }
    }

    /// Read what's available, up to `READ_BUDGET` bytes. Returns `true`
    /// when the socket has nothing more to give right now.
    fn fill(&mut self) -> io::Result<bool> {
        let mut buf = [0; 4096];
        let mut total = 0;
        while !self.read_closed {
            if total >= READ_BUDGET { return Ok(false) }
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    // the stream has ended for real
                    self.read_closed = true;
                }
                Ok(n) => {
                    total += n;
                    self.reader.receive_chunk(&buf[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Throw away incoming bytes until the client hangs up or sends too much
    fn drain(&mut self, mut discarded: usize) -> Action {
        let mut buf = [0; 4096];
        loop {
            if discarded >= DRAIN_LIMIT {
                debug!("giving up draining {} after {} bytes", self.peer, discarded);
                return Action::Close
            }
            match self.stream.read(&mut buf) {
                Ok(0) => return Action::Close,
                Ok(n) => discarded += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.phase = Phase::Draining { discarded };
                    return Action::Idle
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Action::Close,
            }
        }
    }

    /// Write out pending bytes until done or the socket is full
    fn flush(&mut self) -> io::Result<()> {
        while self.bytes_written < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.bytes_written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes")),
                Ok(n) => self.bytes_written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.write_buf.clear();
        self.bytes_written = 0;
        Ok(())
    }
}
