use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use udio::net::UdpSocket;
use udio::{Error, ErrorKind, EventLoop, Family, Recv};

mod util;
use util::init;

const HELLO: &[u8] = b"Hello, UDP Echo Server!";

fn bound(event_loop: &EventLoop) -> UdpSocket {
    let socket = UdpSocket::new(event_loop, Family::V4).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    socket
}

#[test]
fn echo_round_trip() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let server = bound(&event_loop);
    let client = bound(&event_loop);
    let server_addr = server.local_addr().unwrap();
    let client_addr = client.local_addr().unwrap();

    // Server: receive one datagram and send it straight back.
    let server_seen: Rc<RefCell<Option<Recv>>> = Rc::new(RefCell::new(None));
    {
        let seen = Rc::clone(&server_seen);
        let echo = server.clone();
        server.async_receive_from(vec![0; 1500], move |result, mut buf| {
            let recv = result.unwrap();
            *seen.borrow_mut() = Some(recv);
            buf.truncate(recv.len);
            echo.async_send_to(buf, recv.peer, |result, _| {
                assert_eq!(result.unwrap(), HELLO.len());
            });
        });
    }

    // Client: send, await the echo, stop the loop.
    let echoed: Rc<RefCell<Option<(Recv, Vec<u8>)>>> = Rc::new(RefCell::new(None));
    {
        let echoed = Rc::clone(&echoed);
        let receiver = client.clone();
        client.async_send_to(HELLO.to_vec(), server_addr, move |result, _| {
            assert_eq!(result.unwrap(), HELLO.len());
            let echoed = Rc::clone(&echoed);
            let stopper = stopper.clone();
            receiver.async_receive_from(vec![0; 1500], move |result, buf| {
                *echoed.borrow_mut() = Some((result.unwrap(), buf));
                stopper.stop();
            });
        });
    }

    event_loop.run().unwrap();

    let seen = server_seen.borrow().expect("server never heard the client");
    assert_eq!(seen.len, HELLO.len());
    assert_eq!(seen.peer, client_addr);

    let echoed = echoed.borrow_mut().take().expect("client never got the echo");
    let (recv, buf) = echoed;
    assert_eq!(recv.len, HELLO.len());
    assert_eq!(recv.peer, server_addr);
    assert_eq!(&buf[..recv.len], HELLO);
}

#[test]
fn three_message_sequence_is_fifo() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let receiver = bound(&event_loop);
    let sender = bound(&event_loop);
    let dest = receiver.local_addr().unwrap();

    let messages: [&[u8]; 3] = [b"Test message 1", b"Test message 2", b"Test message 3"];

    // All three sends queue behind one another on the same socket...
    for message in messages {
        sender.async_send_to(message.to_vec(), dest, move |result, _| {
            assert_eq!(result.unwrap(), message.len());
        });
    }

    // ...and all three receives queue on the other. Completions must come
    // back in submission order carrying the payloads in send order.
    let got: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    for index in 0..messages.len() {
        let got = Rc::clone(&got);
        let stopper = stopper.clone();
        receiver.async_receive_from(vec![0; 1500], move |result, buf| {
            let recv = result.unwrap();
            got.borrow_mut().push(buf[..recv.len].to_vec());
            if index == 2 {
                stopper.stop();
            }
        });
    }

    event_loop.run().unwrap();

    let got = got.borrow();
    assert_eq!(got.len(), 3);
    for (message, received) in messages.iter().zip(got.iter()) {
        assert_eq!(&received[..], *message);
    }
}

#[test]
fn oversized_datagram_is_truncated() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let receiver = bound(&event_loop);
    let sender = bound(&event_loop);
    let dest = receiver.local_addr().unwrap();

    let payload: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
    let expected = payload.clone();
    sender.async_send_to(payload, dest, |result, _| {
        assert_eq!(result.unwrap(), 2048);
    });

    let outcome: Rc<RefCell<Option<(Error, Vec<u8>)>>> = Rc::new(RefCell::new(None));
    {
        let outcome = Rc::clone(&outcome);
        receiver.async_receive_from(vec![0; 1024], move |result, buf| {
            *outcome.borrow_mut() = Some((result.unwrap_err(), buf));
            stopper.stop();
        });
    }

    event_loop.run().unwrap();

    // 2048 bytes into a 1024-byte buffer: the completion carries the
    // message-truncated error, the clamped length, and the sender.
    let (err, buf) = outcome.borrow_mut().take().unwrap();
    assert_eq!(err.kind(), ErrorKind::MessageTruncated);
    let recv = err
        .truncation()
        .expect("a truncated receive reports the clamped transfer");
    assert_eq!(recv.len, 1024);
    assert_eq!(recv.peer, sender.local_addr().unwrap());
    assert_eq!(&buf[..], &expected[..1024]);
}

#[test]
fn close_cancels_pending_receive() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let socket = bound(&event_loop);

    let cancelled = Rc::new(RefCell::new(None));
    {
        let cancelled = Rc::clone(&cancelled);
        socket.async_receive_from(vec![0; 1500], move |result, _| {
            *cancelled.borrow_mut() = Some(result.unwrap_err().kind());
        });
    }

    // The cancellation is delivered before close() returns.
    socket.close();
    assert_eq!(*cancelled.borrow(), Some(ErrorKind::Cancelled));

    // Closing again is a no-op.
    socket.close();
    assert_eq!(*cancelled.borrow(), Some(ErrorKind::Cancelled));
}

#[test]
fn operations_after_close_fail_with_closed() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();
    let socket = bound(&event_loop);
    let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();

    socket.close();

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = Rc::clone(&seen);
        socket.async_send_to(b"late".to_vec(), dest, move |result, _| {
            seen.borrow_mut().push(result.unwrap_err().kind());
        });
    }
    {
        let seen = Rc::clone(&seen);
        socket.async_receive_from(vec![0; 64], move |result, _| {
            seen.borrow_mut().push(result.unwrap_err().kind());
            stopper.stop();
        });
    }

    event_loop.run().unwrap();
    assert_eq!(*seen.borrow(), vec![ErrorKind::Closed, ErrorKind::Closed]);
}

#[test]
fn completions_are_never_inline() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let receiver = bound(&event_loop);
    let sender = bound(&event_loop);
    let dest = receiver.local_addr().unwrap();

    let fired = Rc::new(RefCell::new(false));
    {
        let fired = Rc::clone(&fired);
        sender.async_send_to(b"ping".to_vec(), dest, move |result, _| {
            result.unwrap();
            *fired.borrow_mut() = true;
            stopper.stop();
        });
    }
    // Even a send that completed synchronously in the kernel reports only
    // through run().
    assert!(!*fired.borrow());

    event_loop.run().unwrap();
    assert!(*fired.borrow());
}

#[test]
fn each_callback_fires_exactly_once() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let receiver = bound(&event_loop);
    let sender = bound(&event_loop);
    let dest = receiver.local_addr().unwrap();

    const COUNT: usize = 8;
    let sends = Rc::new(RefCell::new(0usize));
    let recvs = Rc::new(RefCell::new(0usize));

    for _ in 0..COUNT {
        let sends = Rc::clone(&sends);
        sender.async_send_to(vec![7; 32], dest, move |result, _| {
            result.unwrap();
            *sends.borrow_mut() += 1;
        });
        let recvs = Rc::clone(&recvs);
        let stopper = stopper.clone();
        receiver.async_receive_from(vec![0; 64], move |result, _| {
            result.unwrap();
            *recvs.borrow_mut() += 1;
            if *recvs.borrow() == COUNT {
                stopper.stop();
            }
        });
    }

    event_loop.run().unwrap();
    assert_eq!(*sends.borrow(), COUNT);
    assert_eq!(*recvs.borrow(), COUNT);
}

#[test]
fn receive_timeout_expires() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();
    let socket = bound(&event_loop);
    socket
        .set_receive_timeout(Some(std::time::Duration::from_millis(50)))
        .unwrap();

    let outcome = Rc::new(RefCell::new(None));
    {
        let outcome = Rc::clone(&outcome);
        socket.async_receive_from(vec![0; 64], move |result, _| {
            *outcome.borrow_mut() = Some(result.unwrap_err().kind());
            stopper.stop();
        });
    }

    let started = std::time::Instant::now();
    event_loop.run().unwrap();
    assert_eq!(*outcome.borrow(), Some(ErrorKind::TimedOut));
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[test]
fn wrong_family_destination_is_rejected() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();
    let socket = bound(&event_loop);
    let v6_dest: SocketAddr = "[::1]:4433".parse().unwrap();

    let outcome = Rc::new(RefCell::new(None));
    {
        let outcome = Rc::clone(&outcome);
        socket.async_send_to(b"nope".to_vec(), v6_dest, move |result, _| {
            *outcome.borrow_mut() = Some(result.unwrap_err().kind());
            stopper.stop();
        });
    }

    event_loop.run().unwrap();
    assert_eq!(*outcome.borrow(), Some(ErrorKind::InvalidEndpoint));
}

#[test]
fn bind_conflict_reports_addr_in_use() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let first = bound(&event_loop);
    let second = UdpSocket::new(&event_loop, Family::V4).unwrap();
    let err = second.bind(first.local_addr().unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AddrInUse);
}

#[test]
fn connected_socket_reports_true_origin() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let server = bound(&event_loop);
    let client = bound(&event_loop);
    let server_addr = server.local_addr().unwrap();
    client.connect(server_addr).unwrap();

    client.async_send(b"hi".to_vec(), |result, _| {
        assert_eq!(result.unwrap(), 2);
    });

    let server_echo = server.clone();
    server.async_receive_from(vec![0; 64], move |result, buf| {
        let recv = result.unwrap();
        server_echo.async_send_to(buf[..recv.len].to_vec(), recv.peer, |result, _| {
            result.unwrap();
        });
    });

    let origin = Rc::new(RefCell::new(None));
    {
        let origin = Rc::clone(&origin);
        client.async_receive_from(vec![0; 64], move |result, _| {
            *origin.borrow_mut() = Some(result.unwrap().peer);
            stopper.stop();
        });
    }

    event_loop.run().unwrap();
    assert_eq!(*origin.borrow(), Some(server_addr));
}
