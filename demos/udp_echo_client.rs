//! Sends one datagram and prints the echo.
//!
//! Usage: `udp_echo_client [server] [message]` (default `127.0.0.1:8080`).

use std::net::SocketAddr;

use udio::net::UdpSocket;
use udio::{EventLoop, Family};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let server: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".into())
        .parse()?;
    let message = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "Hello, UDP Echo Server!".into());

    let event_loop = EventLoop::new()?;
    let stopper = event_loop.stopper();

    let socket = UdpSocket::new(&event_loop, Family::of(&server))?;
    let receiver = socket.clone();
    socket.async_send_to(message.into_bytes(), server, move |result, _| {
        match result {
            Ok(n) => println!("sent {} bytes", n),
            Err(err) => {
                eprintln!("send failed: {}", err);
                stopper.stop();
                return;
            }
        }
        receiver.async_receive_from(vec![0; 2048], move |result, buf| {
            match result {
                Ok(recv) => println!(
                    "echo from {}: {}",
                    recv.peer,
                    String::from_utf8_lossy(&buf[..recv.len])
                ),
                Err(err) => eprintln!("receive failed: {}", err),
            }
            stopper.stop();
        });
    });

    event_loop.run()?;
    Ok(())
}
