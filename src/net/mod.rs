//! Networking primitives: the asynchronous UDP socket.

mod udp;

pub use self::udp::UdpSocket;
