use std::time::{Duration, Instant};

use udio::EventLoop;

mod util;
use util::init;

#[test]
fn stop_from_another_thread_interrupts_the_wait() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        stopper.stop();
    });

    let started = Instant::now();
    event_loop.run().unwrap();
    let elapsed = started.elapsed();
    handle.join().unwrap();

    assert!(
        elapsed < Duration::from_secs(1),
        "run() took {:?} to notice the stop",
        elapsed
    );
}

#[test]
fn stop_before_run_returns_immediately() {
    init();
    let event_loop = EventLoop::new().unwrap();
    event_loop.stopper().stop();
    event_loop.run().unwrap();
}

#[test]
fn loop_can_run_again_after_stopping() {
    init();
    let event_loop = EventLoop::new().unwrap();

    for _ in 0..3 {
        let stopper = event_loop.stopper();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            stopper.stop();
        });
        event_loop.run().unwrap();
        handle.join().unwrap();
        assert!(!event_loop.is_running());
    }
}

#[test]
fn stoppers_clone_and_stay_valid() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();
    let clones: Vec<_> = (0..4).map(|_| stopper.clone()).collect();

    let handle = std::thread::spawn(move || {
        for stopper in clones {
            stopper.stop();
        }
    });
    event_loop.run().unwrap();
    handle.join().unwrap();
}
