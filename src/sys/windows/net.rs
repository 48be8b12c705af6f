use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Once;

use log::error;
use windows_sys::Win32::Networking::WinSock::{
    self, AF_INET, AF_INET6, FIONBIO, INVALID_SOCKET, IPPROTO_UDP, SOCKADDR, SOCKADDR_IN,
    SOCKADDR_IN6, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOCK_DGRAM, SOL_SOCKET, SO_BROADCAST,
    SO_RCVBUF, SO_REUSEADDR, SO_SNDBUF, WSADATA, WSA_FLAG_NO_HANDLE_INHERIT, WSA_FLAG_OVERLAPPED,
};

use crate::endpoint::Family;

/// Winsock wants a one-time, process-wide startup call.
pub(crate) fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        let mut data: WSADATA = mem::zeroed();
        let result = WinSock::WSAStartup(0x202 /* version 2.2 */, &mut data);
        assert_eq!(result, 0, "unable to initialise Winsock");
    });
}

pub(crate) fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WinSock::WSAGetLastError() })
}

/// One overlapped-capable datagram socket. Closes on drop.
#[derive(Debug)]
pub(crate) struct Socket {
    socket: SOCKET,
}

impl Socket {
    pub(crate) fn new(family: Family) -> io::Result<Socket> {
        init();
        let af = match family {
            Family::V4 => AF_INET,
            Family::V6 => AF_INET6,
        };
        let socket = unsafe {
            WinSock::WSASocketW(
                af as i32,
                SOCK_DGRAM as i32,
                IPPROTO_UDP,
                std::ptr::null(),
                0,
                WSA_FLAG_OVERLAPPED | WSA_FLAG_NO_HANDLE_INHERIT,
            )
        };
        if socket == INVALID_SOCKET {
            return Err(last_error());
        }
        let mut nonblocking: u32 = 1;
        if unsafe { WinSock::ioctlsocket(socket, FIONBIO, &mut nonblocking) } == SOCKET_ERROR {
            let err = last_error();
            unsafe { WinSock::closesocket(socket) };
            return Err(err);
        }
        Ok(Socket { socket })
    }

    pub(crate) fn raw(&self) -> SOCKET {
        self.socket
    }

    pub(crate) fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let len = write_socket_addr(&addr, &mut storage);
        let result =
            unsafe { WinSock::bind(self.socket, &storage as *const _ as *const SOCKADDR, len) };
        if result == SOCKET_ERROR {
            return Err(last_error());
        }
        Ok(())
    }

    pub(crate) fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let len = write_socket_addr(&addr, &mut storage);
        let result =
            unsafe { WinSock::connect(self.socket, &storage as *const _ as *const SOCKADDR, len) };
        if result == SOCKET_ERROR {
            return Err(last_error());
        }
        Ok(())
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
        let result = unsafe {
            WinSock::getsockname(self.socket, &mut storage as *mut _ as *mut SOCKADDR, &mut len)
        };
        if result == SOCKET_ERROR {
            return Err(last_error());
        }
        to_socket_addr(&storage, len)
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
        let result = unsafe {
            WinSock::getpeername(self.socket, &mut storage as *mut _ as *mut SOCKADDR, &mut len)
        };
        if result == SOCKET_ERROR {
            return Err(last_error());
        }
        to_socket_addr(&storage, len)
    }

    pub(crate) fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        self.set_opt(SOL_SOCKET as i32, SO_REUSEADDR as i32, on as i32)
    }

    #[cfg(feature = "dtls")]
    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        // Windows has no SO_REUSEPORT; SO_REUSEADDR already allows the
        // exact-duplicate bind the DTLS listener needs.
        self.set_reuse_address(on)
    }

    pub(crate) fn set_broadcast(&self, on: bool) -> io::Result<()> {
        self.set_opt(SOL_SOCKET as i32, SO_BROADCAST as i32, on as i32)
    }

    pub(crate) fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.set_opt(SOL_SOCKET as i32, SO_SNDBUF as i32, size as i32)
    }

    pub(crate) fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.set_opt(SOL_SOCKET as i32, SO_RCVBUF as i32, size as i32)
    }

    fn set_opt(&self, level: i32, name: i32, value: i32) -> io::Result<()> {
        let result = unsafe {
            WinSock::setsockopt(
                self.socket,
                level,
                name,
                &value as *const _ as *const u8,
                mem::size_of::<i32>() as i32,
            )
        };
        if result == SOCKET_ERROR {
            return Err(last_error());
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if unsafe { WinSock::closesocket(self.socket) } == SOCKET_ERROR {
            error!("error closing socket: {}", last_error());
        }
    }
}

pub(crate) fn write_socket_addr(addr: &SocketAddr, storage: &mut SOCKADDR_STORAGE) -> i32 {
    unsafe {
        match addr {
            SocketAddr::V4(addr) => {
                let sin = &mut *(storage as *mut _ as *mut SOCKADDR_IN);
                sin.sin_family = AF_INET;
                sin.sin_port = addr.port().to_be();
                sin.sin_addr.S_un.S_addr = u32::from_ne_bytes(addr.ip().octets());
                mem::size_of::<SOCKADDR_IN>() as i32
            }
            SocketAddr::V6(addr) => {
                let sin6 = &mut *(storage as *mut _ as *mut SOCKADDR_IN6);
                sin6.sin6_family = AF_INET6;
                sin6.sin6_port = addr.port().to_be();
                sin6.sin6_addr.u.Byte = addr.ip().octets();
                sin6.Anonymous.sin6_scope_id = addr.scope_id();
                mem::size_of::<SOCKADDR_IN6>() as i32
            }
        }
    }
}

pub(crate) fn to_socket_addr(storage: &SOCKADDR_STORAGE, len: i32) -> io::Result<SocketAddr> {
    unsafe {
        match storage.ss_family {
            AF_INET if len as usize >= mem::size_of::<SOCKADDR_IN>() => {
                let sin = &*(storage as *const _ as *const SOCKADDR_IN);
                let ip = Ipv4Addr::from(sin.sin_addr.S_un.S_addr.to_ne_bytes());
                Ok(SocketAddr::V4(SocketAddrV4::new(
                    ip,
                    u16::from_be(sin.sin_port),
                )))
            }
            AF_INET6 if len as usize >= mem::size_of::<SOCKADDR_IN6>() => {
                let sin6 = &*(storage as *const _ as *const SOCKADDR_IN6);
                let ip = Ipv6Addr::from(sin6.sin6_addr.u.Byte);
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    0,
                    sin6.Anonymous.sin6_scope_id,
                )))
            }
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }
}
