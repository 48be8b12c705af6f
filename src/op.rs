//! Per-operation state.
//!
//! An [`Op`] is created by a socket API call, owned by the event loop's
//! pending set while in flight, and destroyed exactly once, immediately
//! after its completion handler returns. The payload buffer travels inside
//! the record and is handed back through the handler.

use std::fmt;
use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Completion of a receive: how many bytes were copied into the buffer and
/// where the datagram came from.
///
/// A datagram that did not fit the buffer completes through the error path
/// instead, with [`ErrorKind::MessageTruncated`] and this same record -
/// length clamped to the buffer - attached to the error (see
/// [`Error::truncation`]).
///
/// [`ErrorKind::MessageTruncated`]: crate::ErrorKind::MessageTruncated
/// [`Error::truncation`]: crate::Error::truncation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recv {
    /// Bytes copied out, clamped to the buffer's length.
    pub len: usize,
    /// Origin of the datagram, regardless of `connect`.
    pub peer: SocketAddr,
}

/// Handler invoked when a send finishes. Receives the result and the
/// payload buffer back.
pub type SendHandler = Box<dyn FnOnce(Result<usize>, Vec<u8>)>;

/// Handler invoked when a receive finishes. Receives the result and the
/// scratch buffer back.
pub type RecvHandler = Box<dyn FnOnce(Result<Recv>, Vec<u8>)>;

pub(crate) enum Op {
    Send {
        buf: Vec<u8>,
        /// Captured destination; `None` sends on the connected peer.
        peer: Option<SocketAddr>,
        handler: SendHandler,
    },
    Recv {
        buf: Vec<u8>,
        handler: RecvHandler,
    },
}

impl Op {
    pub(crate) fn is_send(&self) -> bool {
        matches!(self, Op::Send { .. })
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Send { buf, peer, .. } => f
                .debug_struct("Op::Send")
                .field("len", &buf.len())
                .field("peer", peer)
                .finish(),
            Op::Recv { buf, .. } => f
                .debug_struct("Op::Recv")
                .field("capacity", &buf.len())
                .finish(),
        }
    }
}

/// Result of one finished operation, matched to the operation's direction.
#[derive(Debug)]
pub(crate) enum Outcome {
    Send(Result<usize>),
    Recv(Result<Recv>),
}

/// A harvested completion waiting for dispatch.
pub(crate) struct Finished {
    /// Pending-set key of the owning socket.
    pub(crate) token: usize,
    pub(crate) op: Op,
    pub(crate) outcome: Outcome,
}

impl Finished {
    pub(crate) fn new(token: usize, op: Op, outcome: Outcome) -> Finished {
        Finished { token, op, outcome }
    }

    /// A completion reporting cancellation, shaped for the operation's kind.
    pub(crate) fn cancelled(token: usize, op: Op) -> Finished {
        let outcome = match op {
            Op::Send { .. } => Outcome::Send(Err(Error::cancelled())),
            Op::Recv { .. } => Outcome::Recv(Err(Error::cancelled())),
        };
        Finished { token, op, outcome }
    }

    /// A completion reporting a single error, shaped for the operation's kind.
    pub(crate) fn failed(token: usize, op: Op, err: Error) -> Finished {
        let outcome = match op {
            Op::Send { .. } => Outcome::Send(Err(err)),
            Op::Recv { .. } => Outcome::Recv(Err(err)),
        };
        Finished { token, op, outcome }
    }

    /// Invoke the completion handler. Consumes the operation; this is the
    /// single point where handlers run.
    pub(crate) fn dispatch(self) {
        match (self.op, self.outcome) {
            (Op::Send { buf, handler, .. }, Outcome::Send(result)) => handler(result, buf),
            (Op::Recv { buf, handler }, Outcome::Recv(result)) => handler(result, buf),
            _ => unreachable!("operation finished with an outcome of the wrong direction"),
        }
    }
}

impl fmt::Debug for Finished {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finished")
            .field("token", &self.token)
            .field("op", &self.op)
            .field("outcome", &self.outcome)
            .finish()
    }
}
