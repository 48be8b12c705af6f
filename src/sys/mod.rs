//! Per-platform backends.
//!
//! Each target compiles exactly one `Driver`: the submission/completion-ring
//! backend on Linux, the readiness-filter backend on the BSDs and macOS, and
//! the completion-port backend on Windows. The backends are concrete types
//! behind one contract (`new`, `add_socket`, `submit`, `close`, `wait`);
//! the uniformity is at the contract level, not a trait object.

#[cfg(unix)]
mod unix;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::unix::uring::{Driver, Waker};

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) use self::unix::kqueue::{Driver, Waker};

#[cfg(unix)]
pub(crate) use self::unix::net::Socket;

#[cfg(windows)]
mod windows;

#[cfg(windows)]
pub(crate) use self::windows::{Driver, Socket, Waker};

#[cfg(not(any(
    unix,
    windows,
)))]
compile_error!("udio supports Linux, Android, the BSDs, macOS and Windows");
