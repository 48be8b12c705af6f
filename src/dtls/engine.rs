//! The record engine: OpenSSL driven through an in-memory datagram
//! transport.
//!
//! The engine never touches a socket. Ciphertext it produces lands in an
//! outbound queue, one datagram per transport write; ciphertext from the
//! wire is fed in as whole datagrams. Each call reports how to proceed:
//! done, or feed more input and retry - the session layer turns those
//! signals into socket operations.

use std::cell::RefCell;
use std::cmp;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::raw::{c_int, c_uchar, c_uint};

use foreign_types::ForeignType;
use log::{trace, warn};
use openssl::ssl::{ErrorCode, ShutdownResult, Ssl, SslContext, SslStream};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// What a completed engine call asks of its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// The call finished; for reads and writes, the bytes moved.
    Done(usize),
    /// Feed another ciphertext datagram, then retry the same call.
    WantInput,
}

/// Shutdown progresses in two observable steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownStatus {
    /// Our close-notify is queued; the peer's has not arrived.
    NotifySent,
    /// Both directions are closed.
    Done,
    /// Feed another datagram to look for the peer's close-notify.
    WantInput,
}

/// Datagram-preserving in-memory transport behind the engine's BIO: each
/// write is one outbound datagram, each read returns exactly one queued
/// inbound datagram.
#[derive(Debug, Default)]
pub(crate) struct Transport {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbound.pop_front() {
            Some(datagram) => {
                let n = cmp::min(buf.len(), datagram.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct Engine {
    stream: SslStream<Transport>,
    /// Cookie the engine-level verify callback accepts (server side).
    cookie: Option<Vec<u8>>,
}

impl Engine {
    pub(crate) fn new(
        ctx: &SslContext,
        role: Role,
        mtu: u32,
        cookie: Option<Vec<u8>>,
    ) -> Result<Engine> {
        let mut ssl = Ssl::new(ctx).map_err(setup_error)?;
        match role {
            Role::Client => ssl.set_connect_state(),
            Role::Server => ssl.set_accept_state(),
        }
        ssl.set_mtu(mtu).map_err(setup_error)?;
        let stream = SslStream::new(ssl, Transport::default()).map_err(setup_error)?;
        Ok(Engine { stream, cookie })
    }

    /// Queue one ciphertext datagram from the wire.
    pub(crate) fn feed(&mut self, datagram: Vec<u8>) {
        self.stream.get_mut().inbound.push_back(datagram);
    }

    /// Pop the next ciphertext datagram destined for the wire.
    pub(crate) fn take_output(&mut self) -> Option<Vec<u8>> {
        self.stream.get_mut().outbound.pop_front()
    }

    pub(crate) fn discard_output(&mut self) {
        self.stream.get_mut().outbound.clear();
    }

    pub(crate) fn handshake(&mut self) -> Result<Status> {
        let result = self.with_cookie(|stream| stream.do_handshake());
        match result {
            Ok(()) => Ok(Status::Done(0)),
            Err(err) => match err.code() {
                ErrorCode::WANT_READ => Ok(Status::WantInput),
                ErrorCode::WANT_WRITE => {
                    // The memory transport never blocks writes.
                    warn!("record engine blocked on write");
                    Ok(Status::WantInput)
                }
                _ => Err(Error::with_detail(
                    ErrorKind::HandshakeFailed,
                    err.to_string(),
                )),
            },
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<Status> {
        let result = self.with_cookie(|stream| stream.ssl_read(buf));
        match result {
            Ok(n) => Ok(Status::Done(n)),
            Err(err) => match err.code() {
                ErrorCode::WANT_READ => Ok(Status::WantInput),
                ErrorCode::ZERO_RETURN => Err(Error::new(ErrorKind::PeerClosed)),
                ErrorCode::SYSCALL if err.io_error().is_none() => {
                    Err(Error::new(ErrorKind::PeerClosed))
                }
                _ => Err(Error::with_detail(ErrorKind::System, err.to_string())),
            },
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<Status> {
        let result = self.with_cookie(|stream| stream.ssl_write(data));
        match result {
            Ok(n) => Ok(Status::Done(n)),
            Err(err) => match err.code() {
                ErrorCode::WANT_READ => Ok(Status::WantInput),
                ErrorCode::ZERO_RETURN => Err(Error::new(ErrorKind::PeerClosed)),
                _ => Err(Error::with_detail(ErrorKind::System, err.to_string())),
            },
        }
    }

    pub(crate) fn shutdown(&mut self) -> Result<ShutdownStatus> {
        let result = self.with_cookie(|stream| stream.shutdown());
        match result {
            Ok(ShutdownResult::Sent) => Ok(ShutdownStatus::NotifySent),
            Ok(ShutdownResult::Received) => Ok(ShutdownStatus::Done),
            Err(err) => match err.code() {
                ErrorCode::WANT_READ => Ok(ShutdownStatus::WantInput),
                ErrorCode::ZERO_RETURN => Ok(ShutdownStatus::Done),
                _ => Err(Error::with_detail(ErrorKind::System, err.to_string())),
            },
        }
    }

    /// Run an engine call with this session's cookie visible to the raw
    /// cookie callbacks. The callbacks fire on this thread, inside the call.
    fn with_cookie<R>(&mut self, f: impl FnOnce(&mut SslStream<Transport>) -> R) -> R {
        struct Reset;
        impl Drop for Reset {
            fn drop(&mut self) {
                ENGINE_COOKIE.with(|slot| slot.borrow_mut().take());
            }
        }

        let _reset = Reset;
        ENGINE_COOKIE.with(|slot| *slot.borrow_mut() = self.cookie.clone());
        f(&mut self.stream)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("transport", self.stream.get_ref())
            .finish()
    }
}

fn setup_error(err: openssl::error::ErrorStack) -> Error {
    Error::with_detail(ErrorKind::System, err.to_string())
}

thread_local! {
    /// Cookie the in-call engine callbacks generate and accept. Sessions
    /// are single-threaded and non-reentrant, so a thread-local scoped to
    /// the engine call is sufficient.
    static ENGINE_COOKIE: RefCell<Option<Vec<u8>>> = const { RefCell::new(None) };
}

/// Enable OpenSSL's cookie-exchange statemachine on a server context.
///
/// The authoritative, constant-time cookie verification already happened at
/// the listener before any per-peer state existed; these callbacks exist so
/// the engine walks the hello-verify path (whose first flight the session
/// discards) and accepts the verified hello on replay.
pub(crate) fn install_cookie_callbacks(ctx: &SslContext) {
    unsafe {
        openssl_sys::SSL_CTX_set_cookie_generate_cb(ctx.as_ptr(), Some(generate_cookie_cb));
        openssl_sys::SSL_CTX_set_cookie_verify_cb(ctx.as_ptr(), Some(verify_cookie_cb));
    }
}

extern "C" fn generate_cookie_cb(
    _ssl: *mut openssl_sys::SSL,
    cookie: *mut c_uchar,
    cookie_len: *mut c_uint,
) -> c_int {
    ENGINE_COOKIE.with(|slot| {
        let slot = slot.borrow();
        let bytes: &[u8] = slot.as_deref().unwrap_or(&[0; super::cookie::COOKIE_LEN]);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), cookie, bytes.len());
            *cookie_len = bytes.len() as c_uint;
        }
        1
    })
}

extern "C" fn verify_cookie_cb(
    _ssl: *mut openssl_sys::SSL,
    cookie: *const c_uchar,
    cookie_len: c_uint,
) -> c_int {
    ENGINE_COOKIE.with(|slot| {
        let slot = slot.borrow();
        let Some(expected) = slot.as_deref() else {
            trace!("engine cookie check without an expected cookie");
            return 0;
        };
        let presented = unsafe { std::slice::from_raw_parts(cookie, cookie_len as usize) };
        (presented == expected) as c_int
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_preserves_datagram_boundaries() {
        let mut transport = Transport::default();
        transport.write_all(b"first").unwrap();
        transport.write_all(b"second datagram").unwrap();
        assert_eq!(transport.outbound.len(), 2);

        transport.inbound.push_back(b"abc".to_vec());
        transport.inbound.push_back(b"defg".to_vec());
        let mut buf = [0u8; 64];
        assert_eq!(transport.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(transport.read(&mut buf).unwrap(), 4);
        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
