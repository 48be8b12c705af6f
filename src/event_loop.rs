//! The reactor/proactor core.
//!
//! One [`EventLoop`] owns one kernel event-notification object (an I/O ring
//! on Linux, a kqueue on the BSDs and macOS, a completion port on Windows)
//! plus the pending set of in-flight operations. Exactly one thread may be
//! inside [`run`] at a time; every completion handler is invoked from that
//! thread. External threads interact with a running loop only through
//! [`Stopper`].
//!
//! [`run`]: EventLoop::run

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::error::{Error, ErrorKind};
use crate::op::{Finished, Op};
use crate::sys;

/// A single-threaded event loop driving asynchronous datagram sockets.
///
/// Sockets are created against a loop (see
/// [`UdpSocket::bind`](crate::net::UdpSocket::bind)); their submissions are
/// serviced and their handlers dispatched while [`run`](EventLoop::run) is
/// executing. The loop is deliberately not `Send`: submissions are legal
/// only from the thread that owns the loop, which in practice means from
/// handlers or from code run before `run()` starts. Multi-threaded designs
/// run one loop per thread.
pub struct EventLoop {
    inner: Rc<Inner>,
}

pub(crate) struct Inner {
    // `None` once the owning `EventLoop` is dropped; the driver is torn
    // down eagerly to break handler -> socket -> loop reference cycles.
    driver: RefCell<Option<sys::Driver>>,
    ready: RefCell<VecDeque<Finished>>,
    // Deferred plain callbacks, dispatched interleaved with completions.
    tasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    running: Cell<bool>,
    stop: Arc<AtomicBool>,
    waker: Arc<sys::Waker>,
}

impl EventLoop {
    /// Create a new event loop, allocating the backend's kernel object and
    /// its interrupter.
    pub fn new() -> Result<EventLoop, Error> {
        let (driver, waker) = sys::Driver::new()?;
        Ok(EventLoop {
            inner: Rc::new(Inner {
                driver: RefCell::new(Some(driver)),
                ready: RefCell::new(VecDeque::new()),
                tasks: RefCell::new(VecDeque::new()),
                running: Cell::new(false),
                stop: Arc::new(AtomicBool::new(false)),
                waker,
            }),
        })
    }

    /// Block the calling thread, servicing submissions and dispatching
    /// completion handlers, until [`Stopper::stop`] is invoked.
    ///
    /// Completions already harvested when a stop is observed are still
    /// dispatched before `run` returns. The stop flag is cleared on return,
    /// so the loop may be run again.
    pub fn run(&self) -> Result<(), Error> {
        if self.inner.running.replace(true) {
            return Err(Error::with_detail(
                ErrorKind::InvalidState,
                "run() re-entered",
            ));
        }
        trace!("event loop running");
        let result = self.run_loop();
        self.inner.running.set(false);
        self.inner.stop.store(false, Ordering::Release);
        trace!("event loop stopped");
        result
    }

    fn run_loop(&self) -> Result<(), Error> {
        loop {
            self.inner.dispatch_ready();
            if self.inner.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            let wait = {
                let mut driver = self.inner.driver.borrow_mut();
                let driver = driver.as_mut().expect("driver torn down while running");
                driver.wait(&mut self.inner.ready.borrow_mut())
            };
            match wait {
                Ok(()) => {}
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// A cloneable, `Send` handle that stops the loop from any thread.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            stop: Arc::clone(&self.inner.stop),
            waker: Arc::clone(&self.inner.waker),
        }
    }

    /// Whether `run()` is currently executing (on this thread, by
    /// construction).
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub(crate) fn inner(&self) -> &Rc<Inner> {
        &self.inner
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Dropping the driver cancels in-kernel work and releases every
        // pending operation, including handlers that may hold sockets (and
        // thereby this loop) alive.
        *self.inner.driver.borrow_mut() = None;
        self.inner.ready.borrow_mut().clear();
        self.inner.tasks.borrow_mut().clear();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.inner.running.get())
            .finish()
    }
}

impl Inner {
    /// Dispatch queued completions and posted tasks until none remain.
    /// Handlers run here and may enqueue more; those drain in the same
    /// pass.
    fn dispatch_ready(&self) {
        loop {
            let finished = self.ready.borrow_mut().pop_front();
            if let Some(finished) = finished {
                trace!("dispatching {:?}", finished);
                finished.dispatch();
                continue;
            }
            let task = self.tasks.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    /// Queue a completion for dispatch from inside `run()`.
    pub(crate) fn post(&self, finished: Finished) {
        self.ready.borrow_mut().push_back(finished);
    }

    /// Queue a plain callback for dispatch from inside `run()`; how work
    /// from outside the completion path is handed to the loop thread.
    #[cfg_attr(not(feature = "dtls"), allow(dead_code))]
    pub(crate) fn post_task(&self, task: Box<dyn FnOnce()>) {
        self.tasks.borrow_mut().push_back(task);
    }

    pub(crate) fn add_socket(&self, socket: &sys::Socket) -> Result<usize, Error> {
        let mut driver = self.driver.borrow_mut();
        match driver.as_mut() {
            Some(driver) => Ok(driver.add_socket(socket.raw())?),
            None => Err(Error::closed()),
        }
    }

    /// Submit an operation. Immediate completions (speculative successes and
    /// submission failures) are queued, never dispatched inline.
    pub(crate) fn submit(&self, token: usize, op: Op) {
        let mut driver = self.driver.borrow_mut();
        match driver.as_mut() {
            Some(driver) => driver.submit(token, op, &mut self.ready.borrow_mut()),
            None => self
                .ready
                .borrow_mut()
                .push_back(Finished::failed(token, op, Error::closed())),
        }
    }

    pub(crate) fn set_recv_timeout(&self, token: usize, timeout: Option<Duration>) {
        if let Some(driver) = self.driver.borrow_mut().as_mut() {
            driver.set_recv_timeout(token, timeout);
        }
    }

    /// Close a socket: cancel its queued and in-flight operations and
    /// deliver their handlers before returning, per the cancellation
    /// contract. Completions harvested for other sockets while reaping are
    /// queued for regular dispatch.
    pub(crate) fn close_socket(&self, token: usize) {
        let mut inline = Vec::new();
        {
            let mut driver = self.driver.borrow_mut();
            if let Some(driver) = driver.as_mut() {
                driver.close(token, &mut inline, &mut self.ready.borrow_mut());
            }
        }
        for finished in inline {
            trace!("dispatching cancellation {:?}", finished);
            finished.dispatch();
        }
    }
}

/// Stops an [`EventLoop`] from any thread.
///
/// Writes the stop flag and wakes the loop's blocked wait through the
/// interrupter. Stopping a loop that is not running marks it so the next
/// `run()` returns immediately after its first dispatch pass.
#[derive(Clone)]
pub struct Stopper {
    stop: Arc<AtomicBool>,
    waker: Arc<sys::Waker>,
}

impl Stopper {
    /// Request the loop to stop and wake it.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            log::warn!("failed to wake event loop: {}", err);
        }
    }
}

impl std::fmt::Debug for Stopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stopper").finish()
    }
}
