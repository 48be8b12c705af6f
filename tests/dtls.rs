#![cfg(feature = "dtls")]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use udio::dtls::{DtlsContext, DtlsListener, DtlsSession, VerifyPolicy};
use udio::net::UdpSocket;
use udio::{ErrorKind, EventLoop, Family};

mod util;
use util::{init, self_signed_identity};

fn context(common_name: &str) -> DtlsContext {
    let (cert, key) = self_signed_identity(common_name);
    DtlsContext::builder()
        .identity(&cert, &key)
        .verify(VerifyPolicy::allow_self_signed())
        .build()
        .unwrap()
}

/// Cookie exchange, mutually-verified self-signed handshake, and an
/// application echo - all on one loop.
#[test]
fn cookie_exchange_and_echo() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let listener = DtlsListener::bind(
        &event_loop,
        "[::1]:0".parse().unwrap(),
        context("echo-server"),
    )
    .unwrap();
    let server_addr = listener.local_addr();

    // Server: accept one peer, handshake, echo one datagram.
    let server_read = Rc::new(RefCell::new(None));
    {
        let server_read = Rc::clone(&server_read);
        listener.accept(move |result| {
            let session = result.unwrap();
            let on_handshake = session.clone();
            session.handshake(move |result| {
                result.unwrap();
                let on_read = on_handshake.clone();
                let server_read = Rc::clone(&server_read);
                on_handshake.read(vec![0; 1024], move |result, mut buf| {
                    let n = result.unwrap();
                    *server_read.borrow_mut() = Some(n);
                    buf.truncate(n);
                    on_read.write(buf, |result, _| {
                        result.unwrap();
                    });
                });
            });
        });
    }

    // Client: handshake through the cookie exchange, send `ping`, read the
    // echo, shut down.
    let socket = UdpSocket::new(&event_loop, Family::V6).unwrap();
    let session = DtlsSession::client(&context("echo-client"), socket, server_addr).unwrap();
    let client_read = Rc::new(RefCell::new(None));
    let shutdown_outcome = Rc::new(RefCell::new(None));
    {
        let on_handshake = session.clone();
        let client_read = Rc::clone(&client_read);
        let shutdown_outcome = Rc::clone(&shutdown_outcome);
        session.handshake(move |result| {
            result.unwrap();
            let on_write = on_handshake.clone();
            let client_read = Rc::clone(&client_read);
            let shutdown_outcome = Rc::clone(&shutdown_outcome);
            let stopper = stopper.clone();
            on_handshake.write(b"ping".to_vec(), move |result, _| {
                assert_eq!(result.unwrap(), 4);
                let on_read = on_write.clone();
                let client_read = Rc::clone(&client_read);
                let shutdown_outcome = Rc::clone(&shutdown_outcome);
                let stopper = stopper.clone();
                on_write.read(vec![0; 1024], move |result, buf| {
                    let n = result.unwrap();
                    *client_read.borrow_mut() = Some(buf[..n].to_vec());
                    let shutdown_outcome = Rc::clone(&shutdown_outcome);
                    let stopper = stopper.clone();
                    on_read.shutdown(move |result| {
                        *shutdown_outcome.borrow_mut() =
                            Some(result.map_err(|err| err.kind()));
                        stopper.stop();
                    });
                });
            });
        });
    }

    event_loop.run().unwrap();

    assert_eq!(*server_read.borrow(), Some(4));
    assert_eq!(client_read.borrow().as_deref(), Some(&b"ping"[..]));
    // No receive timeout was configured, so shutdown does not wait for the
    // peer's close-notify and reports the truncated close.
    assert_eq!(
        *shutdown_outcome.borrow(),
        Some(Err(ErrorKind::MessageTruncated))
    );
}

/// A hello whose cookie does not recompute is dropped without allocating
/// any per-peer state; an uncookied hello earns a hello-verify-request.
#[test]
fn forged_cookie_allocates_nothing() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let listener = DtlsListener::bind(
        &event_loop,
        "[::1]:0".parse().unwrap(),
        context("cookie-server"),
    )
    .unwrap();
    let server_addr = listener.local_addr();

    let accept_resolved = Rc::new(RefCell::new(false));
    {
        let accept_resolved = Rc::clone(&accept_resolved);
        listener.accept(move |result| {
            // Only the listener going away may resolve this accept.
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
            *accept_resolved.borrow_mut() = true;
        });
    }

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let prober = std::thread::spawn(move || {
        let socket = std::net::UdpSocket::bind("[::1]:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();

        // Forged cookie: no reply of any kind.
        socket
            .send_to(&client_hello(&[0xAA; 32]), server_addr)
            .unwrap();
        let mut buf = [0u8; 2048];
        let forged_reply = socket.recv_from(&mut buf).is_ok();

        // Empty cookie: the listener answers with a hello-verify-request.
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket.send_to(&client_hello(&[]), server_addr).unwrap();
        let verify_reply = match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                assert_eq!(from, server_addr);
                // handshake record carrying a hello-verify-request
                n > 25 && buf[0] == 22 && buf[13] == 3
            }
            Err(_) => false,
        };

        done_tx.send((forged_reply, verify_reply)).unwrap();
        stopper.stop();
    });

    event_loop.run().unwrap();
    prober.join().unwrap();

    let (forged_reply, verify_reply) = done_rx.recv().unwrap();
    assert!(!forged_reply, "a forged cookie must be ignored outright");
    assert!(verify_reply, "an uncookied hello must earn a hello-verify");
    assert!(!*accept_resolved.borrow());

    // Tearing the listener down cancels the outstanding accept.
    listener.close();
    assert!(*accept_resolved.borrow());
}

/// Session operations outside their legal states complete with
/// `InvalidState`, and double reads are rejected.
#[test]
fn session_state_guards() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let stopper = event_loop.stopper();

    let socket = UdpSocket::new(&event_loop, Family::V4).unwrap();
    let session = DtlsSession::client(
        &context("state-client"),
        socket,
        "127.0.0.1:4433".parse::<SocketAddr>().unwrap(),
    )
    .unwrap();

    let outcomes = Rc::new(RefCell::new(Vec::new()));

    // Read and write before the handshake.
    {
        let outcomes = Rc::clone(&outcomes);
        session.read(vec![0; 64], move |result, _| {
            outcomes.borrow_mut().push(result.unwrap_err().kind());
        });
    }
    {
        let outcomes = Rc::clone(&outcomes);
        session.write(b"early".to_vec(), move |result, _| {
            outcomes.borrow_mut().push(result.unwrap_err().kind());
        });
    }
    // Shutdown before the handshake.
    {
        let outcomes = Rc::clone(&outcomes);
        session.shutdown(move |result| {
            outcomes.borrow_mut().push(result.unwrap_err().kind());
            stopper.stop();
        });
    }

    event_loop.run().unwrap();
    assert_eq!(
        *outcomes.borrow(),
        vec![
            ErrorKind::InvalidState,
            ErrorKind::InvalidState,
            ErrorKind::InvalidState
        ]
    );
}

/// Closing a session cancels its pending operations before returning.
#[test]
fn close_cancels_pending_session_read() {
    init();
    let event_loop = EventLoop::new().unwrap();

    let listener = DtlsListener::bind(
        &event_loop,
        "[::1]:0".parse().unwrap(),
        context("close-server"),
    )
    .unwrap();

    let socket = UdpSocket::new(&event_loop, Family::V6).unwrap();
    let session =
        DtlsSession::client(&context("close-client"), socket, listener.local_addr()).unwrap();

    let outcome = Rc::new(RefCell::new(None));
    {
        let outcome = Rc::clone(&outcome);
        session.handshake(move |result| {
            *outcome.borrow_mut() = Some(result.unwrap_err().kind());
        });
    }

    // The handshake is mid-flight; closing must resolve it.
    session.close();
    assert_eq!(*outcome.borrow(), Some(ErrorKind::Cancelled));

    session.close();
    assert_eq!(*outcome.borrow(), Some(ErrorKind::Cancelled));
}

/// Minimal DTLS 1.2 client-hello for probing the listener from outside.
fn client_hello(cookie: &[u8]) -> Vec<u8> {
    let suites: &[u8] = &[0x00, 0x02, 0xc0, 0x2b, 0x01, 0x00];
    let body_len = 2 + 32 + 1 + 1 + cookie.len() + suites.len();
    let record_len = 12 + body_len;

    let mut out = Vec::new();
    out.push(22); // handshake record
    out.extend_from_slice(&[254, 255]);
    out.extend_from_slice(&[0, 0]); // epoch
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // sequence
    out.extend_from_slice(&(record_len as u16).to_be_bytes());
    out.push(1); // client_hello
    out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&[0, 0]); // message_seq
    out.extend_from_slice(&[0, 0, 0]); // fragment_offset
    out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&[254, 253]); // client_version
    out.extend_from_slice(&[0x42; 32]); // random
    out.push(0); // empty session id
    out.push(cookie.len() as u8);
    out.extend_from_slice(cookie);
    out.extend_from_slice(suites);
    out
}
