//! Echoes every datagram back to its sender.
//!
//! Usage: `udp_echo_server [port]` (default 8080). Stop with SIGINT.

use std::net::SocketAddr;
use std::sync::OnceLock;

use udio::net::UdpSocket;
use udio::{EventLoop, Family, Stopper};

static STOPPER: OnceLock<Stopper> = OnceLock::new();

const BUFFER: usize = 64 * 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let port: u16 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    let event_loop = EventLoop::new()?;
    let _ = STOPPER.set(event_loop.stopper());
    install_signal_handlers();

    let socket = UdpSocket::new(&event_loop, Family::V4)?;
    socket.bind(addr)?;
    println!("listening on {}", socket.local_addr()?);

    receive(socket);
    event_loop.run()?;
    println!("bye");
    Ok(())
}

fn receive(socket: UdpSocket) {
    let next = socket.clone();
    socket.async_receive_from(vec![0; BUFFER], move |result, mut buf| {
        match result {
            Ok(recv) => {
                println!("{} bytes from {}", recv.len, recv.peer);
                buf.truncate(recv.len);
                next.async_send_to(buf, recv.peer, |result, _| {
                    if let Err(err) = result {
                        eprintln!("echo failed: {}", err);
                    }
                });
                receive(next);
            }
            Err(err) => eprintln!("receive failed: {}", err),
        }
    });
}

#[cfg(unix)]
fn install_signal_handlers() {
    extern "C" fn on_signal(_signum: libc::c_int) {
        if let Some(stopper) = STOPPER.get() {
            stopper.stop();
        }
    }
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}
