//! Readiness-filter backend (kqueue on the BSDs and macOS).
//!
//! Each descriptor has one pending-send and one pending-receive slot.
//! Submission attempts the non-blocking syscall immediately; success queues
//! the completion for same-iteration dispatch, `EAGAIN` parks the operation
//! in its slot and registers the matching `EV_CLEAR` filter. When the kernel
//! reports readiness the parked syscall is re-run and the slot drains until
//! it would block again.
//!
//! The write filter is deleted whenever the send slot empties and re-added
//! by the next submission: some descriptor types spin under edge-triggered
//! write readiness when the filter is left installed with nothing to write.

use std::cmp;
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::{Error, ErrorKind};
use crate::op::{Finished, Op, Outcome, Recv};
use crate::sys::unix::net::{to_socket_addr, write_socket_addr};
use crate::util::Slab;

const EVENT_CAPACITY: usize = 256;

// `udata` value (and `ident`) for the user-event interrupter; socket tokens
// stay well below this.
const WAKE_TOKEN: usize = usize::MAX;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "dragonfly", target_os = "ios", target_os = "macos"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $udata: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $udata as *mut libc::c_void,
        }
    };
}

#[derive(Default)]
struct SlotDir {
    slot: Option<Op>,
    queue: VecDeque<Op>,
    armed: bool,
}

struct SocketState {
    fd: RawFd,
    send: SlotDir,
    recv: SlotDir,
    recv_timeout: Option<Duration>,
    recv_deadline: Option<Instant>,
}

pub(crate) struct Driver {
    kq: RawFd,
    sockets: Slab<SocketState>,
    events: Vec<libc::kevent>,
}

impl Driver {
    pub(crate) fn new() -> io::Result<(Driver, Arc<Waker>)> {
        let kq = syscall!(kqueue())?;
        if let Err(err) = syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)) {
            let _ = syscall!(close(kq));
            return Err(err);
        }

        // The interrupter: a user-event filter triggered from any thread
        // through a dup of the queue descriptor.
        let mut ev = kevent!(
            WAKE_TOKEN,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
            WAKE_TOKEN
        );
        if let Err(err) = syscall!(kevent(kq, &ev, 1, &mut ev, 1, ptr::null())) {
            let _ = syscall!(close(kq));
            return Err(err);
        }
        let waker_fd = syscall!(dup(kq))?;

        Ok((
            Driver {
                kq,
                sockets: Slab::new(),
                events: Vec::with_capacity(EVENT_CAPACITY),
            },
            Arc::new(Waker { kq: waker_fd }),
        ))
    }

    pub(crate) fn add_socket(&mut self, fd: RawFd) -> io::Result<usize> {
        Ok(self.sockets.insert(SocketState {
            fd,
            send: SlotDir::default(),
            recv: SlotDir::default(),
            recv_timeout: None,
            recv_deadline: None,
        }))
    }

    pub(crate) fn set_recv_timeout(&mut self, token: usize, timeout: Option<Duration>) {
        if let Some(socket) = self.sockets.get_mut(token) {
            socket.recv_timeout = timeout;
        }
    }

    pub(crate) fn submit(&mut self, token: usize, op: Op, ready: &mut VecDeque<Finished>) {
        let Some(socket) = self.sockets.get_mut(token) else {
            ready.push_back(Finished::failed(token, op, Error::closed()));
            return;
        };
        let dir = if op.is_send() {
            &mut socket.send
        } else {
            &mut socket.recv
        };
        if dir.slot.is_some() || !dir.queue.is_empty() {
            dir.queue.push_back(op);
            return;
        }
        self.try_start(token, op, ready);
    }

    /// Speculatively run the syscall; park the operation on `EAGAIN`.
    fn try_start(&mut self, token: usize, mut op: Op, ready: &mut VecDeque<Finished>) {
        let Some(socket) = self.sockets.get_mut(token) else {
            ready.push_back(Finished::failed(token, op, Error::closed()));
            return;
        };
        match perform(socket.fd, &mut op) {
            Ok(outcome) => ready.push_back(Finished::new(token, op, outcome)),
            Err(ref err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                let is_send = op.is_send();
                let fd = socket.fd;
                let dir = if is_send {
                    &mut socket.send
                } else {
                    &mut socket.recv
                };
                dir.slot = Some(op);
                if !is_send {
                    socket.recv_deadline = socket.recv_timeout.map(|t| Instant::now() + t);
                }
                if let Err(err) = self.arm(fd, token, is_send) {
                    let socket = self.sockets.get_mut(token).expect("checked above");
                    let dir = if is_send {
                        &mut socket.send
                    } else {
                        &mut socket.recv
                    };
                    let op = dir.slot.take().expect("just parked");
                    ready.push_back(Finished::failed(token, op, err.into()));
                }
            }
            Err(err) => ready.push_back(Finished::failed(token, op, err.into())),
        }
    }

    fn arm(&mut self, fd: RawFd, token: usize, write: bool) -> io::Result<()> {
        let filter = if write {
            libc::EVFILT_WRITE
        } else {
            libc::EVFILT_READ
        };
        let mut ev = kevent!(
            fd,
            filter,
            libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
            token
        );
        kevent_apply(self.kq, &mut ev)?;
        let socket = self.sockets.get_mut(token).expect("armed for live socket");
        if write {
            socket.send.armed = true;
        } else {
            socket.recv.armed = true;
        }
        Ok(())
    }

    fn disarm(&mut self, fd: RawFd, token: usize, write: bool) {
        let filter = if write {
            libc::EVFILT_WRITE
        } else {
            libc::EVFILT_READ
        };
        let mut ev = kevent!(fd, filter, libc::EV_DELETE | libc::EV_RECEIPT, token);
        // ENOENT means the filter was never installed; nothing to undo.
        if let Err(err) = kevent_apply(self.kq, &mut ev) {
            if err.raw_os_error() != Some(libc::ENOENT) {
                warn!("failed to remove filter for fd {}: {}", fd, err);
            }
        }
        if let Some(socket) = self.sockets.get_mut(token) {
            if write {
                socket.send.armed = false;
            } else {
                socket.recv.armed = false;
            }
        }
    }

    pub(crate) fn wait(&mut self, ready: &mut VecDeque<Finished>) -> io::Result<()> {
        let timeout = self.next_deadline().map(|deadline| {
            let left = deadline.saturating_duration_since(Instant::now());
            libc::timespec {
                tv_sec: cmp::min(left.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
                tv_nsec: libc::c_long::from(left.subsec_nanos() as i32),
            }
        });
        let timeout_ptr = timeout
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        self.events.clear();
        let n = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ptr,
        ))?;
        // SAFETY: the kernel wrote `n` events.
        unsafe { self.events.set_len(n as usize) };

        let fired: Vec<(usize, Filter, u16, u32)> = self
            .events
            .iter()
            .map(|ev| (ev.udata as usize, ev.filter, ev.flags, ev.fflags))
            .collect();
        for (token, filter, flags, fflags) in fired {
            if token == WAKE_TOKEN {
                continue;
            }
            if !self.sockets.contains(token) {
                continue;
            }
            let failure = event_error(flags, fflags);
            if filter == libc::EVFILT_READ {
                self.on_ready(token, false, failure, ready);
            } else if filter == libc::EVFILT_WRITE {
                self.on_ready(token, true, failure, ready);
            }
        }

        self.expire_deadlines(ready);
        Ok(())
    }

    /// Run the parked syscall for a readiness event, then keep draining the
    /// queue until it would block again.
    fn on_ready(
        &mut self,
        token: usize,
        write: bool,
        failure: Option<Error>,
        ready: &mut VecDeque<Finished>,
    ) {
        let Some(socket) = self.sockets.get_mut(token) else {
            return;
        };
        let fd = socket.fd;
        let dir = if write {
            &mut socket.send
        } else {
            &mut socket.recv
        };
        let Some(mut op) = dir.slot.take() else {
            return;
        };

        if let Some(err) = failure {
            ready.push_back(Finished::failed(token, op, err));
        } else {
            loop {
                match perform(fd, &mut op) {
                    Ok(outcome) => {
                        ready.push_back(Finished::new(token, op, outcome));
                        let socket = self.sockets.get_mut(token).expect("live socket");
                        let dir = if write {
                            &mut socket.send
                        } else {
                            &mut socket.recv
                        };
                        match dir.queue.pop_front() {
                            Some(next) => op = next,
                            None => break,
                        }
                    }
                    Err(ref err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                        // Still blocked; the filter stays installed.
                        let socket = self.sockets.get_mut(token).expect("live socket");
                        if write {
                            socket.send.slot = Some(op);
                        } else {
                            socket.recv.slot = Some(op);
                            socket.recv_deadline =
                                socket.recv_timeout.map(|t| Instant::now() + t);
                        }
                        return;
                    }
                    Err(err) => {
                        ready.push_back(Finished::failed(token, op, err.into()));
                        break;
                    }
                }
            }
        }

        // Slot and queue are empty; drop interest until the next submission.
        if !write {
            if let Some(socket) = self.sockets.get_mut(token) {
                socket.recv_deadline = None;
            }
        }
        self.disarm(fd, token, write);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sockets
            .iter()
            .filter_map(|(_, socket)| socket.recv_deadline)
            .min()
    }

    fn expire_deadlines(&mut self, ready: &mut VecDeque<Finished>) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .sockets
            .iter()
            .filter(|(_, socket)| matches!(socket.recv_deadline, Some(d) if d <= now))
            .map(|(token, _)| token)
            .collect();
        for token in expired {
            let (fd, op, next) = {
                let socket = self.sockets.get_mut(token).expect("expired for live socket");
                socket.recv_deadline = None;
                let op = socket.recv.slot.take();
                (socket.fd, op, socket.recv.queue.pop_front())
            };
            let Some(op) = op else { continue };
            trace!("receive timed out on fd {}", fd);
            ready.push_back(Finished::failed(token, op, Error::new(ErrorKind::TimedOut)));
            match next {
                Some(next) => self.try_start(token, next, ready),
                None => self.disarm(fd, token, false),
            }
        }
    }

    pub(crate) fn close(
        &mut self,
        token: usize,
        inline: &mut Vec<Finished>,
        _ready: &mut VecDeque<Finished>,
    ) {
        let Some(mut socket) = self.sockets.remove(token) else {
            return;
        };
        for op in socket
            .send
            .slot
            .take()
            .into_iter()
            .chain(socket.send.queue.drain(..))
            .chain(socket.recv.slot.take())
            .chain(socket.recv.queue.drain(..))
        {
            inline.push(Finished::cancelled(token, op));
        }
        // Closing the descriptor drops its filters as well; deleting here
        // only avoids spurious events until the caller's close lands.
        for (filter, armed) in [
            (libc::EVFILT_WRITE, socket.send.armed),
            (libc::EVFILT_READ, socket.recv.armed),
        ] {
            if armed {
                let mut ev = kevent!(socket.fd, filter, libc::EV_DELETE | libc::EV_RECEIPT, 0);
                let _ = kevent_apply(self.kq, &mut ev);
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Err(err) = syscall!(close(self.kq)) {
            warn!("error closing kqueue: {}", err);
        }
    }
}

/// Apply one change entry, surfacing per-entry `EV_ERROR` data.
fn kevent_apply(kq: RawFd, ev: &mut libc::kevent) -> io::Result<()> {
    syscall!(kevent(kq, ev, 1, ev, 1, ptr::null()))?;
    if ev.flags & libc::EV_ERROR != 0 && ev.data != 0 {
        return Err(io::Error::from_raw_os_error(ev.data as i32));
    }
    Ok(())
}

fn event_error(flags: u16, fflags: u32) -> Option<Error> {
    if flags & libc::EV_ERROR != 0 {
        Some(Error::new(ErrorKind::System))
    } else if flags & libc::EV_EOF != 0 && fflags != 0 {
        Some(Error::from_raw_os_error(fflags as i32))
    } else {
        None
    }
}

/// Run the non-blocking syscall for one operation.
fn perform(fd: RawFd, op: &mut Op) -> io::Result<Outcome> {
    match op {
        Op::Send { buf, peer, .. } => {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut iov = libc::iovec {
                iov_base: buf.as_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            if let Some(peer) = peer {
                msg.msg_namelen = write_socket_addr(peer, &mut storage);
                msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
            }
            let n = syscall!(sendmsg(fd, &msg, 0))?;
            Ok(Outcome::Send(Ok(n as usize)))
        }
        Op::Recv { buf, .. } => {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = syscall!(recvmsg(fd, &mut msg, 0))?;
            let peer = to_socket_addr(&storage, msg.msg_namelen)?;
            let recv = Recv {
                len: n as usize,
                peer,
            };
            if msg.msg_flags as libc::c_int & libc::MSG_TRUNC != 0 {
                // Datagram exceeded the buffer: the clamped transfer rides
                // on the error.
                Ok(Outcome::Recv(Err(Error::truncated(recv))))
            } else {
                Ok(Outcome::Recv(Ok(recv)))
            }
        }
    }
}

/// Interrupter for the readiness backend: triggers the queue's user-event
/// filter through a dup'ed descriptor, safe from any thread.
#[derive(Debug)]
pub(crate) struct Waker {
    kq: RawFd,
}

impl Waker {
    pub(crate) fn wake(&self) -> io::Result<()> {
        let mut ev = kevent!(
            WAKE_TOKEN,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_RECEIPT,
            WAKE_TOKEN
        );
        ev.fflags = libc::NOTE_TRIGGER;
        syscall!(kevent(self.kq, &ev, 1, &mut ev, 1, ptr::null())).map(|_| ())
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        let _ = syscall!(close(self.kq));
    }
}
