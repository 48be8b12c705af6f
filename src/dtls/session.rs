//! The DTLS session state machine.

use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use log::trace;

use crate::error::{Error, ErrorKind, Result};
use crate::net::UdpSocket;

use super::context::DtlsContext;
use super::cookie;
use super::engine::{Engine, Role, ShutdownStatus, Status};

/// Ciphertext datagrams are bounded by the engine MTU; this leaves slack.
const RECV_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Handshaking,
    Connected,
    ShuttingDown,
    Closed,
}

type DoneHandler = Box<dyn FnOnce(Result<()>)>;
type TransferHandler = Box<dyn FnOnce(Result<usize>, Vec<u8>)>;

struct PendingTransfer {
    buf: Vec<u8>,
    handler: TransferHandler,
}

/// What the state machine asks the driver to do next.
enum Step {
    Send(Vec<u8>),
    Recv,
    Complete(Box<dyn FnOnce()>),
    Idle,
}

/// A DTLS 1.2 session over one connected UDP socket.
///
/// The session is single-user: at most one outstanding [`read`], one
/// outstanding [`write`], and [`handshake`] / [`shutdown`] are mutually
/// exclusive with both. Violations complete with
/// [`ErrorKind::InvalidState`]. All handlers run from inside the event
/// loop, like every other completion in this crate.
///
/// Client sessions are built with [`DtlsSession::client`]; server sessions
/// come out of a [`DtlsListener`](super::DtlsListener) once a peer passes
/// the cookie exchange.
///
/// [`read`]: DtlsSession::read
/// [`write`]: DtlsSession::write
/// [`handshake`]: DtlsSession::handshake
/// [`shutdown`]: DtlsSession::shutdown
#[derive(Clone)]
pub struct DtlsSession {
    inner: Rc<RefCell<SessionInner>>,
}

struct SessionInner {
    socket: UdpSocket,
    peer: SocketAddr,
    engine: Engine,
    state: State,

    sending: bool,
    receiving: bool,
    want_input: bool,
    io_error: Option<Error>,
    recv_timeout: Option<Duration>,

    pending_handshake: Option<DoneHandler>,
    pending_read: Option<PendingTransfer>,
    pending_write: Option<PendingTransfer>,
    pending_shutdown: Option<DoneHandler>,
}

impl DtlsSession {
    /// Create a client session. The socket is connected to `peer` here;
    /// hand it over unconnected.
    pub fn client(context: &DtlsContext, socket: UdpSocket, peer: SocketAddr) -> Result<DtlsSession> {
        socket.connect(peer)?;
        let engine = Engine::new(context.ssl_context(), Role::Client, context.mtu(), None)?;
        Ok(DtlsSession::from_parts(socket, peer, engine))
    }

    /// Create a server session for a peer whose cookie already verified.
    ///
    /// The engine is brought in line with the client by replaying the
    /// exchange: the verified hello minus its cookie plays the initial
    /// hello, the engine's answering hello-verify flight is discarded, and
    /// the verified hello itself is queued for the handshake proper.
    pub(crate) fn server(
        context: &DtlsContext,
        socket: UdpSocket,
        peer: SocketAddr,
        hello_datagram: &[u8],
        expected_cookie: Vec<u8>,
    ) -> Result<DtlsSession> {
        let mut engine = Engine::new(
            context.ssl_context(),
            Role::Server,
            context.mtu(),
            Some(expected_cookie),
        )?;
        let hello = cookie::parse_client_hello(hello_datagram).ok_or_else(|| {
            Error::with_detail(ErrorKind::HandshakeFailed, "accepted datagram is not a hello")
        })?;
        engine.feed(cookie::synthesize_initial_hello(&hello));
        match engine.handshake()? {
            Status::WantInput => {}
            Status::Done(..) => {
                return Err(Error::with_detail(
                    ErrorKind::HandshakeFailed,
                    "engine skipped the cookie exchange",
                ));
            }
        }
        engine.discard_output();
        engine.feed(hello_datagram.to_vec());
        Ok(DtlsSession::from_parts(socket, peer, engine))
    }

    fn from_parts(socket: UdpSocket, peer: SocketAddr, engine: Engine) -> DtlsSession {
        DtlsSession {
            inner: Rc::new(RefCell::new(SessionInner {
                socket,
                peer,
                engine,
                state: State::Fresh,
                sending: false,
                receiving: false,
                want_input: false,
                io_error: None,
                recv_timeout: None,
                pending_handshake: None,
                pending_read: None,
                pending_write: None,
                pending_shutdown: None,
            })),
        }
    }

    /// The session's peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.borrow().peer
    }

    /// Bound the time any single receive below this session may pend;
    /// also what makes [`shutdown`](DtlsSession::shutdown) wait for the
    /// peer's close-notify at all.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.recv_timeout = timeout;
        inner.socket.set_receive_timeout(timeout)
    }

    /// Drive the handshake to completion.
    pub fn handshake<F>(&self, handler: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Fresh {
                let err = inner.state_error();
                inner.post(Box::new(move || handler(Err(err))));
                return;
            }
            inner.state = State::Handshaking;
            inner.pending_handshake = Some(Box::new(handler));
        }
        drive(&self.inner);
    }

    /// Read one application datagram's plaintext into `buf`.
    pub fn read<F>(&self, buf: Vec<u8>, handler: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + 'static,
    {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Connected || inner.pending_read.is_some() {
                let err = if inner.state == State::Connected {
                    Error::new(ErrorKind::InvalidState)
                } else {
                    inner.state_error()
                };
                inner.post(Box::new(move || handler(Err(err), buf)));
                return;
            }
            inner.pending_read = Some(PendingTransfer {
                buf,
                handler: Box::new(handler),
            });
        }
        drive(&self.inner);
    }

    /// Write one application datagram.
    pub fn write<F>(&self, buf: Vec<u8>, handler: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + 'static,
    {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Connected || inner.pending_write.is_some() {
                let err = if inner.state == State::Connected {
                    Error::new(ErrorKind::InvalidState)
                } else {
                    inner.state_error()
                };
                inner.post(Box::new(move || handler(Err(err), buf)));
                return;
            }
            inner.pending_write = Some(PendingTransfer {
                buf,
                handler: Box::new(handler),
            });
        }
        drive(&self.inner);
    }

    /// Shut the session down: send one close-notify, and wait for the
    /// peer's only as long as the receive timeout allows. A missing peer
    /// close-notify surfaces [`ErrorKind::MessageTruncated`]; the session
    /// still ends cleanly.
    pub fn shutdown<F>(&self, handler: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        {
            let mut inner = self.inner.borrow_mut();
            let busy = inner.pending_read.is_some() || inner.pending_write.is_some();
            if inner.state != State::Connected || busy {
                let err = if inner.state == State::Connected {
                    Error::new(ErrorKind::InvalidState)
                } else {
                    inner.state_error()
                };
                inner.post(Box::new(move || handler(Err(err))));
                return;
            }
            inner.state = State::ShuttingDown;
            inner.pending_shutdown = Some(Box::new(handler));
        }
        drive(&self.inner);
    }

    /// Close the session's socket. Pending session operations complete
    /// with [`ErrorKind::Cancelled`] before `close` returns; closing twice
    /// is a no-op.
    pub fn close(&self) {
        let (socket, completions) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == State::Closed {
                return;
            }
            inner.state = State::Closed;
            let completions = inner.take_pending(|| Error::cancelled());
            (inner.socket.clone(), completions)
        };
        // Borrow released: the socket's own cancellations re-enter the
        // session through the drive continuations.
        socket.close();
        for completion in completions {
            completion();
        }
    }
}

impl fmt::Debug for DtlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("DtlsSession")
            .field("peer", &inner.peer)
            .field("state", &inner.state)
            .finish()
    }
}

impl SessionInner {
    fn state_error(&self) -> Error {
        match self.state {
            State::Closed => Error::closed(),
            _ => Error::new(ErrorKind::InvalidState),
        }
    }

    fn post(&self, task: Box<dyn FnOnce()>) {
        self.socket.loop_inner().post_task(task);
    }

    /// Take every pending completion, bound to per-operation errors.
    fn take_pending(&mut self, err: impl Fn() -> Error) -> Vec<Box<dyn FnOnce()>> {
        let mut out: Vec<Box<dyn FnOnce()>> = Vec::new();
        if let Some(handler) = self.pending_handshake.take() {
            let err = err();
            out.push(Box::new(move || handler(Err(err))));
        }
        if let Some(pending) = self.pending_read.take() {
            let err = err();
            out.push(Box::new(move || (pending.handler)(Err(err), pending.buf)));
        }
        if let Some(pending) = self.pending_write.take() {
            let err = err();
            out.push(Box::new(move || (pending.handler)(Err(err), pending.buf)));
        }
        if let Some(handler) = self.pending_shutdown.take() {
            let err = err();
            out.push(Box::new(move || handler(Err(err))));
        }
        out
    }

    /// One increment of engine progress; called in a loop by `drive`.
    fn step(&mut self) -> Step {
        // Transport failures first: a receive timeout resolves only the
        // operation that was waiting, anything else ends the session.
        if let Some(err) = self.io_error.take() {
            return self.fail_with(err);
        }
        if self.state == State::Closed {
            return Step::Idle;
        }

        // Ciphertext due on the wire goes out before anything else.
        if !self.sending {
            if let Some(datagram) = self.engine.take_output() {
                self.sending = true;
                return Step::Send(datagram);
            }
        }

        if self.pending_handshake.is_some() {
            match self.engine.handshake() {
                Ok(Status::Done(..)) => {
                    trace!("handshake with {} complete", self.peer);
                    self.state = State::Connected;
                    let handler = self.pending_handshake.take().expect("checked above");
                    return Step::Complete(Box::new(move || handler(Ok(()))));
                }
                Ok(Status::WantInput) => self.want_input = true,
                Err(err) => {
                    self.state = State::Closed;
                    let handler = self.pending_handshake.take().expect("checked above");
                    return Step::Complete(Box::new(move || handler(Err(err))));
                }
            }
        }

        if self.state == State::Connected && self.pending_read.is_some() {
            let pending = self.pending_read.as_mut().expect("checked above");
            match self.engine.read(&mut pending.buf) {
                Ok(Status::Done(n)) => {
                    let pending = self.pending_read.take().expect("checked above");
                    return Step::Complete(Box::new(move || (pending.handler)(Ok(n), pending.buf)));
                }
                Ok(Status::WantInput) => self.want_input = true,
                Err(err) => {
                    self.state = State::Closed;
                    let pending = self.pending_read.take().expect("checked above");
                    return Step::Complete(Box::new(move || {
                        (pending.handler)(Err(err), pending.buf)
                    }));
                }
            }
        }

        if self.state == State::Connected && self.pending_write.is_some() {
            let pending = self.pending_write.as_mut().expect("checked above");
            match self.engine.write(&pending.buf) {
                Ok(Status::Done(n)) => {
                    let pending = self.pending_write.take().expect("checked above");
                    return Step::Complete(Box::new(move || (pending.handler)(Ok(n), pending.buf)));
                }
                Ok(Status::WantInput) => self.want_input = true,
                Err(err) => {
                    self.state = State::Closed;
                    let pending = self.pending_write.take().expect("checked above");
                    return Step::Complete(Box::new(move || {
                        (pending.handler)(Err(err), pending.buf)
                    }));
                }
            }
        }

        if self.state == State::ShuttingDown && self.pending_shutdown.is_some() {
            match self.engine.shutdown() {
                Ok(ShutdownStatus::Done) => {
                    self.state = State::Closed;
                    let handler = self.pending_shutdown.take().expect("checked above");
                    return Step::Complete(Box::new(move || handler(Ok(()))));
                }
                Ok(ShutdownStatus::NotifySent) => {
                    // Loop back: the close-notify flushes, then the next
                    // shutdown call looks for the peer's.
                }
                Ok(ShutdownStatus::WantInput) => {
                    if self.recv_timeout.is_some() {
                        self.want_input = true;
                    } else {
                        // No timeout, no waiting: report the missing peer
                        // close-notify and end cleanly.
                        self.state = State::Closed;
                        let handler = self.pending_shutdown.take().expect("checked above");
                        return Step::Complete(Box::new(move || {
                            handler(Err(Error::with_detail(
                                ErrorKind::MessageTruncated,
                                "peer close-notify not received",
                            )))
                        }));
                    }
                }
                Err(err) => {
                    self.state = State::Closed;
                    let handler = self.pending_shutdown.take().expect("checked above");
                    return Step::Complete(Box::new(move || handler(Err(err))));
                }
            }
        }

        // Ciphertext produced by the calls above (handshake flights, data
        // records, the close-notify) goes out before the session waits for
        // anything.
        if !self.sending {
            if let Some(datagram) = self.engine.take_output() {
                self.sending = true;
                return Step::Send(datagram);
            }
        }

        if self.want_input && !self.receiving {
            self.want_input = false;
            self.receiving = true;
            return Step::Recv;
        }
        Step::Idle
    }

    /// Resolve a transport error against the pending operations.
    fn fail_with(&mut self, err: Error) -> Step {
        if err.kind() == ErrorKind::TimedOut {
            // Only the operation waiting on input resolves; the session
            // survives a timeout.
            if let Some(handler) = self.pending_shutdown.take() {
                self.state = State::Closed;
                return Step::Complete(Box::new(move || {
                    handler(Err(Error::with_detail(
                        ErrorKind::MessageTruncated,
                        "timed out waiting for the peer close-notify",
                    )))
                }));
            }
            if let Some(handler) = self.pending_handshake.take() {
                self.state = State::Closed;
                return Step::Complete(Box::new(move || handler(Err(err))));
            }
            if let Some(pending) = self.pending_read.take() {
                return Step::Complete(Box::new(move || {
                    (pending.handler)(Err(err), pending.buf)
                }));
            }
            if let Some(pending) = self.pending_write.take() {
                return Step::Complete(Box::new(move || {
                    (pending.handler)(Err(err), pending.buf)
                }));
            }
            return Step::Idle;
        }

        self.state = State::Closed;
        let completions = self.take_pending(move || err.clone());
        if completions.is_empty() {
            return Step::Idle;
        }
        Step::Complete(Box::new(move || {
            for completion in completions {
                completion();
            }
        }))
    }
}

/// Pump the state machine, scheduling socket I/O for the engine's wants.
/// Re-entered from each socket completion.
fn drive(sess: &Rc<RefCell<SessionInner>>) {
    loop {
        let step = sess.borrow_mut().step();
        match step {
            Step::Send(datagram) => {
                let continuation = Rc::clone(sess);
                let socket = sess.borrow().socket.clone();
                socket.async_send(datagram, move |result, _buf| {
                    {
                        let mut inner = continuation.borrow_mut();
                        inner.sending = false;
                        if let Err(err) = result {
                            inner.io_error = Some(err);
                        }
                    }
                    drive(&continuation);
                });
                // More engine progress may be possible while the datagram
                // is in flight.
            }
            Step::Recv => {
                let continuation = Rc::clone(sess);
                let socket = sess.borrow().socket.clone();
                socket.async_receive_from(vec![0; RECV_BUFFER], move |result, buf| {
                    {
                        let mut inner = continuation.borrow_mut();
                        inner.receiving = false;
                        match result {
                            Ok(recv) => inner.engine.feed(buf[..recv.len].to_vec()),
                            Err(err) => inner.io_error = Some(err),
                        }
                    }
                    drive(&continuation);
                });
                return;
            }
            Step::Complete(task) => {
                // User completions go through the loop's dispatch queue,
                // keeping the no-inline-completion contract even when the
                // session call itself made the progress.
                sess.borrow().post(task);
            }
            Step::Idle => return,
        }
    }
}
