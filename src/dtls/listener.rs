//! The DTLS listener: one unconnected socket, stateless cookie checks,
//! per-peer sessions only after a cookie verifies.

use std::cell::Cell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;

use log::{debug, trace};
use rand::RngCore;

use crate::endpoint::Family;
use crate::error::{Error, ErrorKind, Result};
use crate::event_loop::{EventLoop, Inner as LoopInner};
use crate::net::UdpSocket;

use super::context::DtlsContext;
use super::cookie;
use super::session::DtlsSession;

const HELLO_BUFFER: usize = 4096;

/// Accepts DTLS peers on a single unconnected datagram socket.
///
/// Each incoming client-hello is judged statelessly: no cookie earns a
/// hello-verify-request computed from the peer's address and the listener's
/// random secret, a wrong cookie is ignored outright, and only a cookie
/// that recomputes - compared in constant time - allocates the per-peer
/// connected socket and [`DtlsSession`]. A flood of spoofed hellos
/// therefore costs this listener one HMAC each and nothing more.
#[derive(Clone)]
pub struct DtlsListener {
    inner: Rc<ListenerInner>,
}

struct ListenerInner {
    event_loop: Rc<LoopInner>,
    socket: UdpSocket,
    context: DtlsContext,
    secret: [u8; cookie::SECRET_LEN],
    local: SocketAddr,
    accepting: Cell<bool>,
}

impl DtlsListener {
    /// Bind the listening socket. The address may be wildcard; per-peer
    /// sockets rebind the same local endpoint, which is why the listener
    /// takes the reuse options on itself.
    pub fn bind(
        event_loop: &EventLoop,
        addr: SocketAddr,
        context: DtlsContext,
    ) -> Result<DtlsListener> {
        let socket = UdpSocket::new(event_loop, Family::of(&addr))?;
        socket.set_reuse_address(true)?;
        socket.sys().set_reuse_port(true)?;
        socket.bind(addr)?;
        let local = socket.local_addr()?;

        let mut secret = [0u8; cookie::SECRET_LEN];
        rand::rng().fill_bytes(&mut secret);

        debug!("dtls listener on {}", local);
        Ok(DtlsListener {
            inner: Rc::new(ListenerInner {
                event_loop: Rc::clone(event_loop.inner()),
                socket,
                context,
                secret,
                local,
                accepting: Cell::new(false),
            }),
        })
    }

    /// The bound endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// Wait for the next peer to pass the cookie exchange. Completes with
    /// a session that still needs [`DtlsSession::handshake`] driven; one
    /// accept may be outstanding at a time.
    pub fn accept<F>(&self, handler: F)
    where
        F: FnOnce(Result<DtlsSession>) + 'static,
    {
        if self.inner.accepting.replace(true) {
            self.inner
                .event_loop
                .post_task(Box::new(move || handler(Err(Error::new(ErrorKind::InvalidState)))));
            return;
        }
        ListenerInner::await_hello(&self.inner, Box::new(handler));
    }

    /// Close the listening socket. An outstanding accept completes with
    /// [`ErrorKind::Cancelled`]; established sessions are unaffected.
    pub fn close(&self) {
        self.inner.socket.close();
    }
}

impl fmt::Debug for DtlsListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsListener")
            .field("local", &self.inner.local)
            .field("accepting", &self.inner.accepting.get())
            .finish()
    }
}

type AcceptHandler = Box<dyn FnOnce(Result<DtlsSession>)>;

impl ListenerInner {
    fn await_hello(this: &Rc<ListenerInner>, handler: AcceptHandler) {
        let inner = Rc::clone(this);
        this.socket
            .async_receive_from(vec![0; HELLO_BUFFER], move |result, buf| {
                match result {
                    Err(err) => {
                        inner.accepting.set(false);
                        handler(Err(err));
                    }
                    Ok(recv) => match inner.judge(&buf[..recv.len], recv.peer) {
                        Some(outcome) => {
                            inner.accepting.set(false);
                            handler(outcome);
                        }
                        None => ListenerInner::await_hello(&inner, handler),
                    },
                }
            });
    }

    /// Judge one datagram. `Some` resolves the accept; `None` keeps
    /// listening (ignored datagram or hello-verify sent).
    fn judge(&self, datagram: &[u8], peer: SocketAddr) -> Option<Result<DtlsSession>> {
        let Some(hello) = cookie::parse_client_hello(datagram) else {
            trace!("ignoring non-hello datagram from {}", peer);
            return None;
        };

        if hello.cookie.is_empty() {
            let verify = cookie::hello_verify_request(&cookie::compute(&self.secret, &peer));
            trace!("hello-verify to {}", peer);
            self.socket.async_send_to(verify, peer, |_, _| {});
            return None;
        }
        if !cookie::verify(&self.secret, &peer, hello.cookie) {
            debug!("ignoring hello with a stale or forged cookie from {}", peer);
            return None;
        }

        Some(self.admit(datagram, peer))
    }

    /// The cookie verified: allocate the per-peer connected socket and its
    /// session.
    fn admit(&self, hello_datagram: &[u8], peer: SocketAddr) -> Result<DtlsSession> {
        let socket = UdpSocket::from_loop(&self.event_loop, Family::of(&self.local))?;
        socket.set_reuse_address(true)?;
        socket.sys().set_reuse_port(true)?;
        socket.bind(self.local)?;
        socket.connect(peer)?;

        debug!("admitting {}", peer);
        DtlsSession::server(
            &self.context,
            socket,
            peer,
            hello_datagram,
            cookie::compute(&self.secret, &peer),
        )
    }
}
