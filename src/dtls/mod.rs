//! DTLS 1.2 sessions over connected UDP sockets.
//!
//! A [`DtlsSession`] drives an OpenSSL record engine through its
//! want-input / want-output signals: ciphertext the engine produces is sent
//! as one datagram per record flight, and whenever the engine needs more
//! ciphertext the session schedules one receive and feeds the datagram
//! back. All of it rides on the [`net::UdpSocket`](crate::net::UdpSocket)
//! completion contract, so session handlers also run only from inside the
//! event loop.
//!
//! Servers start from a [`DtlsListener`], which owns the single unconnected
//! listening socket and performs the stateless cookie exchange: a first
//! client-hello is answered with a hello-verify-request carrying an
//! HMAC-SHA256 cookie over the peer's address, and only a hello whose
//! echoed cookie recomputes - checked in constant time - gets a per-peer
//! connected socket and session allocated.

mod context;
mod cookie;
mod engine;
mod listener;
mod session;

pub use self::context::{DtlsContext, DtlsContextBuilder, VerifyInfo, VerifyPolicy};
pub use self::listener::DtlsListener;
pub use self::session::DtlsSession;
