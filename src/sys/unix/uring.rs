//! Submission/completion-ring backend (Linux io_uring).
//!
//! Every in-flight operation owns a pinned record holding the `msghdr`,
//! `iovec` and address storage the kernel reads or writes; the ring entry's
//! user data is the record's key in the pending set. Submissions are pushed
//! eagerly (`submit` is called whenever entries are queued, which is safe
//! any number of times per loop iteration); completions are harvested in
//! `wait` and mapped back through the pending set.
//!
//! The interrupter is an `eventfd` watched through a re-armed `POLL_ADD`
//! entry: ring submission is only safe from the loop thread, so a stop
//! request from another thread writes the eventfd instead of touching the
//! ring.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};
use log::{error, trace, warn};

use crate::error::{Error, ErrorKind};
use crate::op::{Finished, Op, Outcome, Recv};
use crate::sys::unix::net::{to_socket_addr, write_socket_addr};
use crate::util::Slab;

const RING_ENTRIES: u32 = 256;

// Reserved user-data values; pending-set keys stay well below these.
const WAKE_DATA: u64 = u64::MAX;
const CANCEL_DATA: u64 = u64::MAX - 1;
const TIMEOUT_BIT: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Send,
    Recv,
}

/// Kernel-visible memory for one operation. Boxed so the addresses stay
/// stable while the pending set reallocates.
struct MsgHdr {
    msg: libc::msghdr,
    iov: libc::iovec,
    addr: libc::sockaddr_storage,
    ts: types::Timespec,
}

impl MsgHdr {
    fn new() -> Box<MsgHdr> {
        Box::new(MsgHdr {
            msg: unsafe { mem::zeroed() },
            iov: libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            },
            addr: unsafe { mem::zeroed() },
            ts: types::Timespec::new(),
        })
    }
}

struct InFlight {
    token: usize,
    dir: Dir,
    op: Option<Op>,
    hdr: Box<MsgHdr>,
    /// A `LINK_TIMEOUT` rides behind this entry.
    timed: bool,
    /// `close` asked the kernel to abort this entry.
    cancelling: bool,
}

#[derive(Default)]
struct Direction {
    inflight: Option<usize>,
    queue: VecDeque<Op>,
}

struct SocketState {
    fd: RawFd,
    send: Direction,
    recv: Direction,
    recv_timeout: Option<Duration>,
    closing: bool,
}

pub(crate) struct Driver {
    // Field order matters: the ring must drop (quiescing in-kernel work)
    // before the records in `pending` that the kernel references.
    ring: IoUring,
    sockets: Slab<SocketState>,
    pending: Slab<InFlight>,
    waker: Arc<Waker>,
}

impl Driver {
    pub(crate) fn new() -> io::Result<(Driver, Arc<Waker>)> {
        let ring = IoUring::new(RING_ENTRIES)?;
        let efd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        let waker = Arc::new(Waker { fd: efd });
        let mut driver = Driver {
            ring,
            sockets: Slab::new(),
            pending: Slab::new(),
            waker: Arc::clone(&waker),
        };
        driver.arm_waker();
        Ok((driver, waker))
    }

    pub(crate) fn add_socket(&mut self, fd: RawFd) -> io::Result<usize> {
        Ok(self.sockets.insert(SocketState {
            fd,
            send: Direction::default(),
            recv: Direction::default(),
            recv_timeout: None,
            closing: false,
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
        // One kernel operation per direction; the rest wait their turn.
        if dir.inflight.is_some() || !dir.queue.is_empty() {
            dir.queue.push_back(op);
            return;
        }
        self.start(token, op, ready);
    }

    /// Hand one operation to the kernel.
    fn start(&mut self, token: usize, mut op: Op, ready: &mut VecDeque<Finished>) {
        let Some(socket) = self.sockets.get_mut(token) else {
            ready.push_back(Finished::failed(token, op, Error::closed()));
            return;
        };
        let fd = socket.fd;
        let recv_timeout = socket.recv_timeout;

        let mut hdr = MsgHdr::new();
        let (dir, timed) = match &mut op {
            Op::Send { buf, peer, .. } => {
                hdr.iov.iov_base = buf.as_ptr() as *mut libc::c_void;
                hdr.iov.iov_len = buf.len();
                hdr.msg.msg_iov = &mut hdr.iov;
                hdr.msg.msg_iovlen = 1;
                if let Some(peer) = peer {
                    let len = write_socket_addr(peer, &mut hdr.addr);
                    hdr.msg.msg_name = &mut hdr.addr as *mut _ as *mut libc::c_void;
                    hdr.msg.msg_namelen = len;
                }
                (Dir::Send, false)
            }
            Op::Recv { buf, .. } => {
                hdr.iov.iov_base = buf.as_mut_ptr() as *mut libc::c_void;
                hdr.iov.iov_len = buf.len();
                hdr.msg.msg_iov = &mut hdr.iov;
                hdr.msg.msg_iovlen = 1;
                hdr.msg.msg_name = &mut hdr.addr as *mut _ as *mut libc::c_void;
                hdr.msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                if let Some(timeout) = recv_timeout {
                    hdr.ts = types::Timespec::new()
                        .sec(timeout.as_secs())
                        .nsec(timeout.subsec_nanos());
                }
                (Dir::Recv, recv_timeout.is_some())
            }
        };

        let key = self.pending.insert(InFlight {
            token,
            dir,
            op: Some(op),
            hdr,
            timed,
            cancelling: false,
        });
        // Raw pointers into the boxed record; stable for the operation's
        // lifetime even as the pending set reallocates.
        let (msg_ptr, ts_ptr) = {
            let hdr = &self.pending.get(key).expect("just inserted").hdr;
            (
                &hdr.msg as *const libc::msghdr,
                &hdr.ts as *const types::Timespec,
            )
        };

        let entry = match dir {
            Dir::Send => opcode::SendMsg::new(types::Fd(fd), msg_ptr)
                .build()
                .user_data(key as u64),
            Dir::Recv => opcode::RecvMsg::new(types::Fd(fd), msg_ptr as *mut libc::msghdr)
                .build()
                .user_data(key as u64),
        };

        let pushed = if timed {
            let entry = entry.flags(squeue::Flags::IO_LINK);
            let timeout = opcode::LinkTimeout::new(ts_ptr)
                .build()
                .user_data(key as u64 | TIMEOUT_BIT);
            self.push_entries(&[entry, timeout])
        } else {
            self.push_entries(&[entry])
        };

        if let Err(err) = pushed {
            let mut inflight = self.pending.remove(key).expect("just inserted");
            let op = inflight.op.take().expect("operation present until completion");
            ready.push_back(Finished::failed(token, op, err.into()));
            return;
        }

        trace!("submitted {:?} as {} on fd {}", dir, key, fd);
        let socket = self.sockets.get_mut(token).expect("checked above");
        match dir {
            Dir::Send => socket.send.inflight = Some(key),
            Dir::Recv => socket.recv.inflight = Some(key),
        }
        if let Err(err) = self.flush_ring() {
            // The entries stay queued; the next wait retries the submit.
            warn!("ring submit failed: {}", err);
        }
    }

    /// Push a group of entries as one unit. Linked pairs must land in the
    /// same submission, so room for the whole group is ensured up front.
    fn push_entries(&mut self, entries: &[squeue::Entry]) -> io::Result<()> {
        for attempt in 0..2 {
            {
                let mut sq = self.ring.submission();
                if sq.capacity() - sq.len() >= entries.len() {
                    for entry in entries {
                        // SAFETY: the memory each entry points at lives in
                        // the pending set until its completion is
                        // harvested; room was checked above.
                        if unsafe { sq.push(entry) }.is_err() {
                            return Err(io::Error::new(
                                io::ErrorKind::Other,
                                "submission ring rejected an entry",
                            ));
                        }
                    }
                    return Ok(());
                }
            }
            if attempt == 0 {
                self.flush_ring()?;
            }
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            "submission ring overflow",
        ))
    }

    fn flush_ring(&mut self) -> io::Result<()> {
        loop {
            match self.ring.submit() {
                Ok(_) => return Ok(()),
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                // Completion ring is full; harvesting will make room.
                Err(ref err) if err.raw_os_error() == Some(libc::EBUSY) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn arm_waker(&mut self) {
        let entry = opcode::PollAdd::new(types::Fd(self.waker.fd), libc::POLLIN as u32)
            .build()
            .user_data(WAKE_DATA);
        if let Err(err) = self.push_entries(&[entry]) {
            error!("failed to arm interrupter: {}", err);
        }
    }

    pub(crate) fn wait(&mut self, ready: &mut VecDeque<Finished>) -> io::Result<()> {
        self.flush_ring()?;
        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            // Completion ring overflow: harvest what is there.
            Err(ref err) if err.raw_os_error() == Some(libc::EBUSY) => {}
            Err(err) => return Err(err),
        }
        self.harvest(ready);
        Ok(())
    }

    fn harvest(&mut self, out: &mut VecDeque<Finished>) {
        let cqes: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (user_data, result) in cqes {
            self.complete_entry(user_data, result, out);
        }
    }

    fn complete_entry(&mut self, user_data: u64, result: i32, out: &mut VecDeque<Finished>) {
        if user_data == WAKE_DATA {
            self.waker.drain();
            self.arm_waker();
            return;
        }
        if user_data == CANCEL_DATA || user_data & TIMEOUT_BIT != 0 {
            // Cancel acknowledgements and fired/expired link timeouts carry
            // no operation of their own.
            return;
        }

        let key = user_data as usize;
        let Some(mut inflight) = self.pending.remove(key) else {
            warn!("completion for unknown entry {}", key);
            return;
        };
        let Some(op) = inflight.op.take() else {
            warn!("completion for already-finished entry {}", key);
            return;
        };
        let token = inflight.token;

        let outcome = match inflight.dir {
            Dir::Send => Outcome::Send(if result < 0 {
                Err(map_result(-result, &inflight))
            } else {
                Ok(result as usize)
            }),
            Dir::Recv => Outcome::Recv(if result < 0 {
                Err(map_result(-result, &inflight))
            } else {
                let msg = &inflight.hdr.msg;
                match to_socket_addr(&inflight.hdr.addr, msg.msg_namelen) {
                    Ok(peer) => {
                        let recv = Recv {
                            len: result as usize,
                            peer,
                        };
                        if msg.msg_flags & libc::MSG_TRUNC != 0 {
                            // Datagram exceeded the buffer: the clamped
                            // transfer rides on the error.
                            Err(Error::truncated(recv))
                        } else {
                            Ok(recv)
                        }
                    }
                    Err(err) => Err(err.into()),
                }
            }),
        };
        trace!("harvested {} -> {:?}", key, outcome);
        out.push_back(Finished::new(token, op, outcome));

        // Free the direction and start the next queued operation.
        let next = match self.sockets.get_mut(token) {
            Some(socket) => {
                let dir = match inflight.dir {
                    Dir::Send => &mut socket.send,
                    Dir::Recv => &mut socket.recv,
                };
                dir.inflight = None;
                if socket.closing {
                    None
                } else {
                    dir.queue.pop_front()
                }
            }
            None => None,
        };
        if let Some(next) = next {
            self.start(token, next, out);
        }
    }

    pub(crate) fn close(
        &mut self,
        token: usize,
        inline: &mut Vec<Finished>,
        ready: &mut VecDeque<Finished>,
    ) {
        let Some(socket) = self.sockets.get_mut(token) else {
            return;
        };
        socket.closing = true;
        let watch: Vec<usize> = [socket.send.inflight, socket.recv.inflight]
            .into_iter()
            .flatten()
            .collect();
        let queued: Vec<Op> = socket
            .send
            .queue
            .drain(..)
            .chain(socket.recv.queue.drain(..))
            .collect();

        for &key in &watch {
            if let Some(inflight) = self.pending.get_mut(key) {
                inflight.cancelling = true;
            }
            let cancel = opcode::AsyncCancel::new(key as u64)
                .build()
                .user_data(CANCEL_DATA);
            if let Err(err) = self.push_entries(&[cancel]) {
                error!("failed to queue cancellation for {}: {}", key, err);
            }
        }

        // Reap until the kernel has let go of every record (and the caller
        // buffers inside them) belonging to this socket.
        let mut harvested = VecDeque::new();
        while watch.iter().any(|&key| self.pending.contains(key)) {
            if let Err(err) = self.flush_ring() {
                error!("ring submit during close failed: {}", err);
                break;
            }
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(ref err) if err.raw_os_error() == Some(libc::EBUSY) => {}
                Err(err) => {
                    error!("ring wait during close failed: {}", err);
                    break;
                }
            }
            self.harvest(&mut harvested);
        }
        for finished in harvested {
            if finished.token == token {
                inline.push(finished);
            } else {
                ready.push_back(finished);
            }
        }
        for op in queued {
            inline.push(Finished::cancelled(token, op));
        }
        self.sockets.remove(token);
    }
}

/// Map a completion's negated errno, taking cancellation provenance into
/// account: an abort requested by `close` reports `Cancelled`, an abort by
/// the linked receive timeout reports `TimedOut`.
fn map_result(errno: i32, inflight: &InFlight) -> Error {
    if errno == libc::ECANCELED {
        if inflight.cancelling {
            Error::cancelled()
        } else if inflight.timed {
            Error::new(ErrorKind::TimedOut)
        } else {
            Error::cancelled()
        }
    } else {
        Error::from_raw_os_error(errno)
    }
}

/// Interrupter for the ring backend: an `eventfd` the loop watches, written
/// from any thread.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: RawFd,
}

impl Waker {
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall!(write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len())) {
            Ok(_) => Ok(()),
            // The counter is saturated; the loop is awake already.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Reset the counter so the next wait blocks. Always called before the
    /// poll entry is re-armed, otherwise a stop would latch forever.
    fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = syscall!(read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()));
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        let _ = syscall!(close(self.fd));
    }
}
