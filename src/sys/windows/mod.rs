//! Completion-port backend (Windows IOCP).
//!
//! Every in-flight operation is a heap record whose first field is the
//! `OVERLAPPED` the kernel hands back on completion; the record also pins
//! the `WSABUF` and address storage for the call's duration. `WSASendTo`
//! and `WSARecvFrom` issue the work, `GetQueuedCompletionStatusEx` harvests
//! it, and `PostQueuedCompletionStatus` doubles as the interrupter.

pub(crate) mod net;

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, trace, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    WSAGetOverlappedResult, WSARecvFrom, WSASendTo, SOCKADDR, SOCKADDR_STORAGE, SOCKET,
    SOCKET_ERROR, WSABUF, WSAEMSGSIZE, WSA_IO_PENDING,
};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
    OVERLAPPED, OVERLAPPED_ENTRY,
};

use crate::error::{Error, ErrorKind};
use crate::op::{Finished, Op, Outcome, Recv};
use crate::util::Slab;

pub(crate) use self::net::Socket;

const ENTRY_CAPACITY: usize = 64;

// Completion key for the interrupter; socket tokens stay well below this.
const WAKE_KEY: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Send,
    Recv,
}

/// Kernel-visible memory for one operation; the `OVERLAPPED` header must be
/// the first field so the dequeued pointer is also the record pointer.
#[repr(C)]
struct OverlappedOp {
    overlapped: OVERLAPPED,
    wsabuf: WSABUF,
    addr: SOCKADDR_STORAGE,
    addr_len: i32,
    flags: u32,
    token: usize,
    dir: Dir,
    /// The receive timeout aborted this entry.
    timed: bool,
    /// `close` aborted this entry.
    cancelling: bool,
    op: Option<Op>,
}

#[derive(Default)]
struct Direction {
    inflight: Option<*mut OverlappedOp>,
    queue: VecDeque<Op>,
}

struct SocketState {
    socket: SOCKET,
    send: Direction,
    recv: Direction,
    recv_timeout: Option<Duration>,
    recv_deadline: Option<Instant>,
    closing: bool,
}

pub(crate) struct Driver {
    port: HANDLE,
    sockets: Slab<SocketState>,
}

impl Driver {
    pub(crate) fn new() -> io::Result<(Driver, Arc<Waker>)> {
        net::init();
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok((
            Driver {
                port,
                sockets: Slab::new(),
            },
            Arc::new(Waker { port }),
        ))
    }

    pub(crate) fn add_socket(&mut self, socket: SOCKET) -> io::Result<usize> {
        let token = self.sockets.insert(SocketState {
            socket,
            send: Direction::default(),
            recv: Direction::default(),
            recv_timeout: None,
            recv_deadline: None,
            closing: false,
        });
        let result =
            unsafe { CreateIoCompletionPort(socket as HANDLE, self.port, token, 0) };
        if result.is_null() {
            self.sockets.remove(token);
            return Err(io::Error::last_os_error());
        }
        Ok(token)
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
        if dir.inflight.is_some() || !dir.queue.is_empty() {
            dir.queue.push_back(op);
            return;
        }
        self.start(token, op, ready);
    }

    /// Issue the overlapped call for one operation.
    fn start(&mut self, token: usize, mut op: Op, ready: &mut VecDeque<Finished>) {
        let Some(socket) = self.sockets.get_mut(token) else {
            ready.push_back(Finished::failed(token, op, Error::closed()));
            return;
        };
        let handle = socket.socket;
        let recv_timeout = socket.recv_timeout;

        let mut record = Box::new(OverlappedOp {
            overlapped: unsafe { mem::zeroed() },
            wsabuf: WSABUF {
                len: 0,
                buf: ptr::null_mut(),
            },
            addr: unsafe { mem::zeroed() },
            addr_len: 0,
            flags: 0,
            token,
            dir: if op.is_send() { Dir::Send } else { Dir::Recv },
            timed: false,
            cancelling: false,
            op: None,
        });

        let issued = match &mut op {
            Op::Send { buf, peer, .. } => {
                record.wsabuf.buf = buf.as_ptr() as *mut u8;
                record.wsabuf.len = buf.len() as u32;
                let (name, name_len) = match peer {
                    Some(peer) => {
                        record.addr_len = net::write_socket_addr(peer, &mut record.addr);
                        (&record.addr as *const _ as *const SOCKADDR, record.addr_len)
                    }
                    None => (ptr::null(), 0),
                };
                unsafe {
                    WSASendTo(
                        handle,
                        &record.wsabuf,
                        1,
                        ptr::null_mut(),
                        0,
                        name,
                        name_len,
                        &mut record.overlapped,
                        None,
                    )
                }
            }
            Op::Recv { buf, .. } => {
                record.wsabuf.buf = buf.as_mut_ptr();
                record.wsabuf.len = buf.len() as u32;
                record.addr_len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
                unsafe {
                    WSARecvFrom(
                        handle,
                        &record.wsabuf,
                        1,
                        ptr::null_mut(),
                        &mut record.flags,
                        &mut record.addr as *mut _ as *mut SOCKADDR,
                        &mut record.addr_len,
                        &mut record.overlapped,
                        None,
                    )
                }
            }
        };

        if issued == SOCKET_ERROR {
            let raw = unsafe { windows_sys::Win32::Networking::WinSock::WSAGetLastError() };
            if raw != WSA_IO_PENDING {
                // Failed outright; no completion will be posted.
                ready.push_back(Finished::failed(token, op, Error::from_raw_os_error(raw)));
                return;
            }
        }
        // Success or pending: a completion packet is queued either way
        // (FILE_SKIP_COMPLETION_PORT_ON_SUCCESS is deliberately not set).

        let is_send = op.is_send();
        record.op = Some(op);
        let raw = Box::into_raw(record);
        let socket = self.sockets.get_mut(token).expect("checked above");
        if is_send {
            socket.send.inflight = Some(raw);
        } else {
            socket.recv.inflight = Some(raw);
            socket.recv_deadline = recv_timeout.map(|t| Instant::now() + t);
        }
        trace!("issued overlapped {:?} on socket {}", raw, handle);
    }

    pub(crate) fn wait(&mut self, ready: &mut VecDeque<Finished>) -> io::Result<()> {
        let timeout = match self.next_deadline() {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                left.as_millis().min(u128::from(INFINITE - 1)) as u32
            }
            None => INFINITE,
        };
        self.poll_once(timeout, ready)?;
        self.expire_deadlines(ready);
        Ok(())
    }

    fn poll_once(&mut self, timeout: u32, out: &mut VecDeque<Finished>) -> io::Result<()> {
        let mut entries: [OVERLAPPED_ENTRY; ENTRY_CAPACITY] = unsafe { mem::zeroed() };
        let mut count: u32 = 0;
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                ENTRY_CAPACITY as u32,
                &mut count,
                timeout,
                0,
            )
        };
        if ok == 0 {
            let raw = unsafe { GetLastError() };
            if raw == WAIT_TIMEOUT {
                return Ok(());
            }
            return Err(io::Error::from_raw_os_error(raw as i32));
        }
        for entry in entries.iter().take(count as usize) {
            if entry.lpCompletionKey == WAKE_KEY {
                continue;
            }
            if entry.lpOverlapped.is_null() {
                continue;
            }
            // SAFETY: every non-sentinel packet on this port carries an
            // `OverlappedOp` issued by `start`, whose ownership returns to
            // us exactly once, here.
            let record = unsafe { Box::from_raw(entry.lpOverlapped as *mut OverlappedOp) };
            self.complete_record(record, entry.dwNumberOfBytesTransferred as usize, out);
        }
        Ok(())
    }

    fn complete_record(
        &mut self,
        mut record: Box<OverlappedOp>,
        bytes: usize,
        out: &mut VecDeque<Finished>,
    ) {
        let token = record.token;
        let Some(op) = record.op.take() else {
            warn!("completion for already-finished record");
            return;
        };

        let status = match self.sockets.get(token) {
            Some(socket) => {
                let mut transferred: u32 = 0;
                let mut flags: u32 = 0;
                let ok = unsafe {
                    WSAGetOverlappedResult(
                        socket.socket,
                        &record.overlapped,
                        &mut transferred,
                        0,
                        &mut flags,
                    )
                };
                if ok != 0 {
                    Ok(transferred as usize)
                } else {
                    Err(unsafe { windows_sys::Win32::Networking::WinSock::WSAGetLastError() })
                }
            }
            None => Ok(bytes),
        };

        let outcome = match record.dir {
            Dir::Send => Outcome::Send(match status {
                Ok(n) => Ok(n),
                Err(raw) => Err(map_result(raw, &record)),
            }),
            Dir::Recv => match status {
                Ok(n) => Outcome::Recv(
                    net::to_socket_addr(&record.addr, record.addr_len)
                        .map(|peer| Recv { len: n, peer })
                        .map_err(Error::from),
                ),
                // A datagram larger than the buffer still fills it; the
                // error carries the clamped transfer and the origin.
                Err(raw) if raw == WSAEMSGSIZE => Outcome::Recv(
                    match net::to_socket_addr(&record.addr, record.addr_len) {
                        Ok(peer) => Err(Error::truncated(Recv { len: bytes, peer })),
                        Err(err) => Err(Error::from(err)),
                    },
                ),
                Err(raw) => Outcome::Recv(Err(map_result(raw, &record))),
            },
        };
        out.push_back(Finished::new(token, op, outcome));

        let next = match self.sockets.get_mut(token) {
            Some(socket) => {
                let dir = match record.dir {
                    Dir::Send => &mut socket.send,
                    Dir::Recv => {
                        socket.recv_deadline = None;
                        &mut socket.recv
                    }
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

    fn next_deadline(&self) -> Option<Instant> {
        self.sockets
            .iter()
            .filter_map(|(_, socket)| socket.recv_deadline)
            .min()
    }

    fn expire_deadlines(&mut self, _ready: &mut VecDeque<Finished>) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .sockets
            .iter()
            .filter(|(_, socket)| matches!(socket.recv_deadline, Some(d) if d <= now))
            .map(|(token, _)| token)
            .collect();
        for token in expired {
            let Some(socket) = self.sockets.get_mut(token) else {
                continue;
            };
            socket.recv_deadline = None;
            if let Some(raw) = socket.recv.inflight {
                let handle = socket.socket as HANDLE;
                unsafe {
                    (*raw).timed = true;
                    if CancelIoEx(handle, &(*raw).overlapped) == 0 {
                        // Already completed; the packet is in the queue.
                        trace!("timeout cancel raced completion");
                    }
                }
            }
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
        let handle = socket.socket as HANDLE;
        let watch: Vec<*mut OverlappedOp> = [socket.send.inflight, socket.recv.inflight]
            .into_iter()
            .flatten()
            .collect();
        let queued: Vec<Op> = socket
            .send
            .queue
            .drain(..)
            .chain(socket.recv.queue.drain(..))
            .collect();

        for &raw in &watch {
            unsafe {
                (*raw).cancelling = true;
                if CancelIoEx(handle, &(*raw).overlapped) == 0 {
                    trace!("close cancel raced completion");
                }
            }
        }

        // Reap until the kernel has returned every record (and the caller
        // buffers inside them) belonging to this socket.
        let mut harvested = VecDeque::new();
        while self
            .sockets
            .get(token)
            .map(|s| s.send.inflight.is_some() || s.recv.inflight.is_some())
            .unwrap_or(false)
        {
            if let Err(err) = self.poll_once(INFINITE, &mut harvested) {
                error!("completion wait during close failed: {}", err);
                break;
            }
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

impl Drop for Driver {
    fn drop(&mut self) {
        // Reclaim any records the kernel still owes us, then the port. A
        // record that never comes back is leaked rather than freed while
        // kernel-visible.
        let mut outstanding = 0;
        for (_, socket) in self.sockets.iter() {
            unsafe {
                let _ = CancelIoEx(socket.socket as HANDLE, ptr::null());
            }
            outstanding += socket.send.inflight.is_some() as usize
                + socket.recv.inflight.is_some() as usize;
        }
        let mut scratch = VecDeque::new();
        while outstanding > 0 {
            let before = scratch.len();
            if self.poll_once(1000, &mut scratch).is_err() {
                break;
            }
            let reaped = scratch.len() - before;
            if reaped == 0 {
                break;
            }
            outstanding = outstanding.saturating_sub(reaped);
        }
        unsafe {
            CloseHandle(self.port);
        }
    }
}

fn map_result(raw: i32, record: &OverlappedOp) -> Error {
    if raw == ERROR_OPERATION_ABORTED as i32 {
        if record.cancelling {
            Error::cancelled()
        } else if record.timed {
            Error::new(ErrorKind::TimedOut)
        } else {
            Error::cancelled()
        }
    } else {
        Error::from_raw_os_error(raw)
    }
}

/// Interrupter for the completion-port backend: posts a sentinel packet.
#[derive(Debug)]
pub(crate) struct Waker {
    port: HANDLE,
}

// The port handle is only ever used with thread-safe completion-port calls.
unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    pub(crate) fn wake(&self) -> io::Result<()> {
        let ok = unsafe { PostQueuedCompletionStatus(self.port, 0, WAKE_KEY, ptr::null_mut()) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
