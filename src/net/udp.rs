use std::cell::Cell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use log::trace;

use crate::endpoint::Family;
use crate::error::{Error, ErrorKind, Result};
use crate::event_loop::{EventLoop, Inner as LoopInner};
use crate::op::{Finished, Op, Recv};
use crate::sys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Bound,
    Connected,
    Closed,
}

/// An asynchronous UDP socket tied to one [`EventLoop`].
///
/// Handles are cheap to clone and refer to the same kernel descriptor,
/// which is what lets a completion handler keep using the socket it was
/// invoked for.
///
/// Datagram boundaries are preserved: one send produces one datagram, one
/// receive consumes one. A datagram larger than the receive buffer fills
/// it and completes with [`ErrorKind::MessageTruncated`], the clamped
/// length and origin riding on the error ([`Error::truncation`]); the tail
/// is gone, as UDP has it.
///
/// At most one kernel operation per direction is in flight at a time;
/// further submissions queue inside the loop in FIFO order, which is also
/// the order their completions are dispatched.
///
/// # Examples
///
/// ```no_run
/// # fn main() -> Result<(), udio::Error> {
/// use udio::net::UdpSocket;
/// use udio::{EventLoop, Family};
///
/// let event_loop = EventLoop::new()?;
/// let socket = UdpSocket::new(&event_loop, Family::V4)?;
/// socket.bind("0.0.0.0:8080".parse().unwrap())?;
///
/// let echo = socket.clone();
/// socket.async_receive_from(vec![0; 1500], move |result, buf| {
///     let recv = result.unwrap();
///     echo.async_send_to(buf[..recv.len].to_vec(), recv.peer, |_, _| {});
/// });
///
/// event_loop.run()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UdpSocket {
    inner: Rc<Inner>,
}

struct Inner {
    event_loop: Rc<LoopInner>,
    sys: sys::Socket,
    token: usize,
    family: Family,
    state: Cell<State>,
}

impl UdpSocket {
    /// Create an unbound datagram socket of the given family, registered
    /// with `event_loop`.
    pub fn new(event_loop: &EventLoop, family: Family) -> Result<UdpSocket> {
        UdpSocket::from_loop(event_loop.inner(), family)
    }

    pub(crate) fn from_loop(event_loop: &Rc<LoopInner>, family: Family) -> Result<UdpSocket> {
        let sys = sys::Socket::new(family)?;
        let token = event_loop.add_socket(&sys)?;
        trace!("created udp socket as token {}", token);
        Ok(UdpSocket {
            inner: Rc::new(Inner {
                event_loop: Rc::clone(event_loop),
                sys,
                token,
                family,
                state: Cell::new(State::Open),
            }),
        })
    }

    /// Bind to a local endpoint. Legal once, before `connect`.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.check_family(&addr)?;
        if self.inner.state.get() != State::Open {
            return Err(Error::new(ErrorKind::InvalidState));
        }
        self.inner.sys.bind(addr)?;
        self.inner.state.set(State::Bound);
        Ok(())
    }

    /// Fix the remote peer. Sends without an explicit destination go to the
    /// peer; receives still report the true origin of each datagram.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.check_family(&addr)?;
        match self.inner.state.get() {
            State::Open | State::Bound => {}
            _ => return Err(Error::new(ErrorKind::InvalidState)),
        }
        self.inner.sys.connect(addr)?;
        self.inner.state.set(State::Connected);
        Ok(())
    }

    /// The locally bound endpoint.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.sys.local_addr()?)
    }

    /// The connected peer, if `connect` was called.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.sys.peer_addr()?)
    }

    /// Allow rebinding a recently used (or shared) local endpoint. Takes
    /// effect at the next `bind`.
    pub fn set_reuse_address(&self, on: bool) -> Result<()> {
        Ok(self.inner.sys.set_reuse_address(on)?)
    }

    /// Permit IPv4 broadcast destinations.
    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        if self.inner.family != Family::V4 {
            return Err(Error::new(ErrorKind::InvalidEndpoint));
        }
        Ok(self.inner.sys.set_broadcast(on)?)
    }

    /// Kernel send-buffer size in bytes.
    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        Ok(self.inner.sys.set_send_buffer_size(size)?)
    }

    /// Kernel receive-buffer size in bytes.
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        Ok(self.inner.sys.set_recv_buffer_size(size)?)
    }

    /// Bound the time an `async_receive_from` may stay pending; expiry
    /// completes it with [`ErrorKind::TimedOut`]. `None` waits forever.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        if self.inner.state.get() == State::Closed {
            return Err(Error::closed());
        }
        self.inner
            .event_loop
            .set_recv_timeout(self.inner.token, timeout);
        Ok(())
    }

    /// Schedule one datagram send to `peer`. The handler receives the
    /// number of bytes sent (the whole buffer, for a datagram socket) and
    /// the buffer back, and runs from inside the event loop - never from
    /// this call.
    pub fn async_send_to<F>(&self, buf: Vec<u8>, peer: SocketAddr, handler: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + 'static,
    {
        let family_ok = Family::of(&peer) == self.inner.family;
        let op = Op::Send {
            buf,
            peer: Some(peer),
            handler: Box::new(handler),
        };
        if !family_ok {
            self.fail(op, Error::new(ErrorKind::InvalidEndpoint));
            return;
        }
        self.route(op);
    }

    /// Schedule one datagram send to the connected peer.
    pub fn async_send<F>(&self, buf: Vec<u8>, handler: F)
    where
        F: FnOnce(Result<usize>, Vec<u8>) + 'static,
    {
        let op = Op::Send {
            buf,
            peer: None,
            handler: Box::new(handler),
        };
        if self.inner.state.get() != State::Connected
            && self.inner.state.get() != State::Closed
        {
            self.fail(op, Error::new(ErrorKind::InvalidState));
            return;
        }
        self.route(op);
    }

    /// Schedule one datagram receive. The handler gets a [`Recv`] (bytes
    /// and origin) and the buffer back, and runs from inside the event
    /// loop - never from this call. An oversized datagram completes with
    /// [`ErrorKind::MessageTruncated`] instead, the clamped transfer
    /// attached to the error.
    pub fn async_receive_from<F>(&self, buf: Vec<u8>, handler: F)
    where
        F: FnOnce(Result<Recv>, Vec<u8>) + 'static,
    {
        let op = Op::Recv {
            buf,
            handler: Box::new(handler),
        };
        self.route(op);
    }

    /// Close the socket, cancelling every queued and in-flight operation.
    ///
    /// Each cancelled handler fires with [`ErrorKind::Cancelled`] before
    /// `close` returns. Closing twice is a no-op; operations submitted
    /// after `close` fail with [`ErrorKind::Closed`].
    pub fn close(&self) {
        if self.inner.state.replace(State::Closed) == State::Closed {
            return;
        }
        trace!("closing udp socket token {}", self.inner.token);
        self.inner.event_loop.close_socket(self.inner.token);
    }

    fn route(&self, op: Op) {
        if self.inner.state.get() == State::Closed {
            self.fail(op, Error::closed());
            return;
        }
        self.inner.event_loop.submit(self.inner.token, op);
    }

    /// Deliver an immediate failure through the loop's dispatch queue,
    /// keeping the no-inline-completion contract.
    fn fail(&self, op: Op, err: Error) {
        self.inner
            .event_loop
            .post(Finished::failed(self.inner.token, op, err));
    }

    fn check_family(&self, addr: &SocketAddr) -> Result<()> {
        if Family::of(addr) != self.inner.family {
            return Err(Error::new(ErrorKind::InvalidEndpoint));
        }
        Ok(())
    }

    #[cfg(feature = "dtls")]
    pub(crate) fn sys(&self) -> &sys::Socket {
        &self.inner.sys
    }

    #[cfg(feature = "dtls")]
    pub(crate) fn loop_inner(&self) -> &Rc<LoopInner> {
        &self.inner.event_loop
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.state.get() != State::Closed {
            self.event_loop.close_socket(self.token);
        }
    }
}

impl fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSocket")
            .field("token", &self.inner.token)
            .field("state", &self.inner.state.get())
            .finish()
    }
}
