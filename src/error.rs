use std::error;
use std::fmt;
use std::io;

use crate::op::Recv;

/// The closed set of error categories a completion can report.
///
/// Every kernel status observed by a backend is normalised into one of these
/// kinds before it reaches a handler; the raw OS code is kept alongside for
/// diagnostics (see [`Error::raw_os_error`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The socket (or session) was closed before or during the operation.
    Closed,
    /// The operation would have blocked. Internal to the readiness backend;
    /// never delivered to a handler.
    WouldBlock,
    /// A datagram (or close-notify) was cut short.
    MessageTruncated,
    /// The peer refused the datagram (ICMP port unreachable).
    ConnectionRefused,
    /// The local endpoint is already bound.
    AddrInUse,
    /// The local endpoint is not available on this host.
    AddrNotAvailable,
    /// The caller may not use this endpoint.
    PermissionDenied,
    /// The endpoint is malformed or of the wrong family.
    InvalidEndpoint,
    /// The operation was cancelled by `close`.
    Cancelled,
    /// The call is not legal in the current state.
    InvalidState,
    /// The DTLS handshake failed.
    HandshakeFailed,
    /// The peer closed the session.
    PeerClosed,
    /// The configured receive timeout expired.
    TimedOut,
    /// Any other system error; the raw code is preserved.
    System,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Closed => "socket closed",
            ErrorKind::WouldBlock => "operation would block",
            ErrorKind::MessageTruncated => "message truncated",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::AddrInUse => "address in use",
            ErrorKind::AddrNotAvailable => "address not available",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::InvalidEndpoint => "invalid endpoint",
            ErrorKind::Cancelled => "operation cancelled",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::HandshakeFailed => "handshake failed",
            ErrorKind::PeerClosed => "peer closed the session",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::System => "system error",
        }
    }
}

/// Error value delivered through completion handlers.
///
/// Carries the normalised [`ErrorKind`], the raw OS code when one exists, and
/// optional free-form detail (used by the DTLS layer to preserve engine
/// diagnostics).
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    raw: Option<i32>,
    detail: Option<String>,
    partial: Option<Recv>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            raw: None,
            detail: None,
            partial: None,
        }
    }

    pub(crate) fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Error {
        Error {
            kind,
            raw: None,
            detail: Some(detail.into()),
            partial: None,
        }
    }

    /// Normalise a raw OS error code.
    pub(crate) fn from_raw_os_error(raw: i32) -> Error {
        Error {
            kind: sys_kind(raw),
            raw: Some(raw),
            detail: None,
            partial: None,
        }
    }

    /// A receive whose datagram exceeded the buffer: the buffer was filled,
    /// the tail discarded, and the clamped transfer rides on the error.
    pub(crate) fn truncated(recv: Recv) -> Error {
        Error {
            kind: ErrorKind::MessageTruncated,
            raw: None,
            detail: None,
            partial: Some(recv),
        }
    }

    /// The normalised category.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The raw OS code this error was mapped from, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.raw
    }

    /// For a [`MessageTruncated`] receive: the bytes that did land (clamped
    /// to the buffer) and the datagram's origin. `None` on every other
    /// error, including the DTLS shutdown's truncated close-notify.
    ///
    /// [`MessageTruncated`]: ErrorKind::MessageTruncated
    pub fn truncation(&self) -> Option<Recv> {
        self.partial
    }

    pub(crate) fn cancelled() -> Error {
        Error::new(ErrorKind::Cancelled)
    }

    pub(crate) fn closed() -> Error {
        Error::new(ErrorKind::Closed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(raw) = self.raw {
            write!(f, " (os error {})", raw)?;
        }
        if let Some(ref detail) = self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(raw) => Error::from_raw_os_error(raw),
            None => {
                let kind = match err.kind() {
                    io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
                    io::ErrorKind::AddrInUse => ErrorKind::AddrInUse,
                    io::ErrorKind::AddrNotAvailable => ErrorKind::AddrNotAvailable,
                    io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                    io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
                    io::ErrorKind::InvalidInput => ErrorKind::InvalidEndpoint,
                    io::ErrorKind::TimedOut => ErrorKind::TimedOut,
                    _ => ErrorKind::System,
                };
                Error::with_detail(kind, err.to_string())
            }
        }
    }
}

/// A specialised `Result` for completion values.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(unix)]
fn sys_kind(raw: i32) -> ErrorKind {
    match raw {
        libc::EAGAIN => ErrorKind::WouldBlock,
        libc::EADDRINUSE => ErrorKind::AddrInUse,
        libc::EADDRNOTAVAIL => ErrorKind::AddrNotAvailable,
        libc::EACCES | libc::EPERM => ErrorKind::PermissionDenied,
        libc::ECONNREFUSED => ErrorKind::ConnectionRefused,
        libc::EINVAL | libc::EAFNOSUPPORT | libc::EDESTADDRREQ | libc::EISCONN => {
            ErrorKind::InvalidEndpoint
        }
        libc::EMSGSIZE => ErrorKind::MessageTruncated,
        libc::ECANCELED => ErrorKind::Cancelled,
        libc::ETIMEDOUT => ErrorKind::TimedOut,
        libc::EBADF | libc::ENOTSOCK | libc::EPIPE => ErrorKind::Closed,
        _ => ErrorKind::System,
    }
}

#[cfg(windows)]
fn sys_kind(raw: i32) -> ErrorKind {
    use windows_sys::Win32::Foundation::ERROR_OPERATION_ABORTED;
    use windows_sys::Win32::Networking::WinSock::{
        WSAEACCES, WSAEADDRINUSE, WSAEADDRNOTAVAIL, WSAEAFNOSUPPORT, WSAECONNREFUSED,
        WSAECONNRESET, WSAEINVAL, WSAEMSGSIZE, WSAENOTSOCK, WSAETIMEDOUT, WSAEWOULDBLOCK,
    };

    match raw {
        _ if raw == WSAEWOULDBLOCK => ErrorKind::WouldBlock,
        _ if raw == WSAEADDRINUSE => ErrorKind::AddrInUse,
        _ if raw == WSAEADDRNOTAVAIL => ErrorKind::AddrNotAvailable,
        _ if raw == WSAEACCES => ErrorKind::PermissionDenied,
        _ if raw == WSAECONNREFUSED || raw == WSAECONNRESET => ErrorKind::ConnectionRefused,
        _ if raw == WSAEINVAL || raw == WSAEAFNOSUPPORT => ErrorKind::InvalidEndpoint,
        _ if raw == WSAEMSGSIZE => ErrorKind::MessageTruncated,
        _ if raw == ERROR_OPERATION_ABORTED as i32 => ErrorKind::Cancelled,
        _ if raw == WSAETIMEDOUT => ErrorKind::TimedOut,
        _ if raw == WSAENOTSOCK => ErrorKind::Closed,
        _ => ErrorKind::System,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn errno_mapping() {
        assert_eq!(
            Error::from_raw_os_error(libc::EADDRINUSE).kind(),
            ErrorKind::AddrInUse
        );
        assert_eq!(
            Error::from_raw_os_error(libc::EACCES).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            Error::from_raw_os_error(libc::ECONNREFUSED).kind(),
            ErrorKind::ConnectionRefused
        );
        assert_eq!(
            Error::from_raw_os_error(libc::ECANCELED).kind(),
            ErrorKind::Cancelled
        );
        let err = Error::from_raw_os_error(libc::ELOOP);
        assert_eq!(err.kind(), ErrorKind::System);
        assert_eq!(err.raw_os_error(), Some(libc::ELOOP));
    }

    #[test]
    fn io_error_round_trip() {
        let err: Error = io::Error::new(io::ErrorKind::AddrInUse, "taken").into();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
    }

    #[test]
    fn truncation_rides_on_the_error() {
        let recv = Recv {
            len: 1024,
            peer: "127.0.0.1:9000".parse().unwrap(),
        };
        let err = Error::truncated(recv);
        assert_eq!(err.kind(), ErrorKind::MessageTruncated);
        assert_eq!(err.truncation(), Some(recv));
        // Other truncation reports (the DTLS close-notify path) carry no
        // transfer.
        assert_eq!(Error::new(ErrorKind::MessageTruncated).truncation(), None);
    }

    #[test]
    #[cfg(unix)]
    fn display_includes_raw_code() {
        let err = Error::from_raw_os_error(libc::EADDRINUSE);
        let s = err.to_string();
        assert!(s.contains("address in use"), "{}", s);
        assert!(s.contains("os error"), "{}", s);
    }
}
