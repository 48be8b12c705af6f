//! udio: asynchronous datagram I/O with a DTLS session layer.
//!
//! udio is a small, single-threaded socket runtime. One [`EventLoop`] drives
//! per-operation state through the native kernel I/O model of the target -
//! an I/O ring on Linux, a kqueue on the BSDs and macOS, a completion port
//! on Windows - under one uniform contract: every submitted operation
//! reaches its completion handler exactly once, on the thread inside
//! [`EventLoop::run`], with success, a normalised kernel error, or a
//! cancellation from [`close`](net::UdpSocket::close).
//!
//! The [`dtls`] module (feature `dtls`, on by default) layers DTLS 1.2
//! sessions over connected UDP sockets, including the stateless server-side
//! cookie exchange.
//!
//! # Guarantees
//!
//! * Handlers never run inline in the submitting call; submissions made
//!   before `run()` are dispatched by `run()`.
//! * Per socket and direction, completions are dispatched in submission
//!   order.
//! * `close` delivers a cancellation to every queued and in-flight
//!   operation before it returns.
//!
//! # Threading
//!
//! The loop and everything created against it are deliberately not `Send`;
//! one loop is one thread. [`Stopper`] is the only handle that crosses
//! threads, and stops a blocked loop through its interrupter.

#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
mod macros;

mod error;
mod event_loop;
mod op;
mod sys;
mod util;

pub mod endpoint;
pub mod net;

pub mod features {
    //! # Feature flags
    //!
    //! * `dtls` (enabled by default): the [`dtls`](crate::dtls) module —
    //!   DTLS 1.2 sessions over connected UDP sockets with the stateless
    //!   server-side cookie exchange. Pulls in OpenSSL plus the HMAC
    //!   primitives the cookie uses. Disable it for the bare datagram
    //!   runtime:
    //!
    //!   ```toml
    //!   udio = { version = "0.3", default-features = false }
    //!   ```
}

cfg_dtls! {
    pub mod dtls;
}

pub use crate::endpoint::Family;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::event_loop::{EventLoop, Stopper};
pub use crate::op::{Recv, RecvHandler, SendHandler};
