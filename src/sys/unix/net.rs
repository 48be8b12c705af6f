use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use log::error;

use crate::endpoint::Family;

/// One non-blocking, close-on-exec datagram descriptor. Closes on drop.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: RawFd,
}

impl Socket {
    pub(crate) fn new(family: Family) -> io::Result<Socket> {
        let domain = match family {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        };

        // No O_NONBLOCK here: the ring honours it by completing with
        // EAGAIN instead of parking the operation, and the ring itself is
        // the non-blocking mechanism on this backend.
        #[cfg(any(target_os = "android", target_os = "linux"))]
        let fd = syscall!(socket(domain, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0))?;

        // The readiness backend wants non-blocking descriptors, and Darwin
        // and the older BSDs lack the atomic creation flags anyway.
        #[cfg(not(any(target_os = "android", target_os = "linux")))]
        let fd = {
            let fd = syscall!(socket(domain, libc::SOCK_DGRAM, 0))?;
            if let Err(err) = syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))
                .and_then(|_| syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC)))
            {
                let _ = syscall!(close(fd));
                return Err(err);
            }
            fd
        };

        let socket = Socket { fd };

        // Sends must report errors through the completion, not a signal.
        #[cfg(any(
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        socket.set_opt(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1 as libc::c_int)?;

        Ok(socket)
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = write_socket_addr(&addr, &mut storage);
        syscall!(bind(
            self.fd,
            &storage as *const _ as *const libc::sockaddr,
            len,
        ))
        .map(|_| ())
    }

    pub(crate) fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = write_socket_addr(&addr, &mut storage);
        syscall!(connect(
            self.fd,
            &storage as *const _ as *const libc::sockaddr,
            len,
        ))
        .map(|_| ())
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        to_socket_addr(&storage, len)
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            self.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        to_socket_addr(&storage, len)
    }

    pub(crate) fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    /// Needed where two descriptors bind the exact same address and port
    /// (the DTLS listener and its per-peer connected sockets).
    #[cfg(feature = "dtls")]
    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
    }

    pub(crate) fn set_broadcast(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_BROADCAST, on as libc::c_int)
    }

    pub(crate) fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int)
    }

    pub(crate) fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int)
    }

    fn set_opt(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        syscall!(setsockopt(
            self.fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Err(err) = syscall!(close(self.fd)) {
            error!("error closing socket {}: {}", self.fd, err);
        }
    }
}

/// Fill `storage` with the kernel representation of `addr`, returning the
/// length the kernel expects.
pub(crate) fn write_socket_addr(
    addr: &SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    unsafe {
        match addr {
            SocketAddr::V4(addr) => {
                let sin = &mut *(storage as *mut _ as *mut libc::sockaddr_in);
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = addr.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                };
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                {
                    sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
                }
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
            }
            SocketAddr::V6(addr) => {
                let sin6 = &mut *(storage as *mut _ as *mut libc::sockaddr_in6);
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = addr.port().to_be();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                };
                sin6.sin6_flowinfo = addr.flowinfo();
                sin6.sin6_scope_id = addr.scope_id();
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                {
                    sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
                }
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
            }
        }
    }
}

/// Read a `SocketAddr` back out of a kernel-filled `sockaddr_storage`.
pub(crate) fn to_socket_addr(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_round_trip() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let v4: SocketAddr = "192.0.2.7:4433".parse().unwrap();
        let len = write_socket_addr(&v4, &mut storage);
        assert_eq!(to_socket_addr(&storage, len).unwrap(), v4);

        let v6: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        let len = write_socket_addr(&v6, &mut storage);
        assert_eq!(to_socket_addr(&storage, len).unwrap(), v6);
    }

    #[test]
    fn rejects_unknown_family() {
        let storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert!(to_socket_addr(&storage, mem::size_of::<libc::sockaddr_storage>() as _).is_err());
    }
}
