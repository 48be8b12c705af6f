//! Endpoint values and their string forms.
//!
//! An endpoint is a plain [`std::net::SocketAddr`]: family tag, address,
//! port (host byte order) and, for IPv6, the scope id. The kernel-native
//! `sockaddr` blob is produced by the `sys` layer when an operation is
//! submitted and lives inside the pinned operation record.
//!
//! This module adds the string forms `std` does not parse: a bare IPv6
//! address with a numeric zone (`fe80::1%5`) and the bracketed
//! address-with-port form carrying a zone (`[fe80::1%5]:443`).

use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::{Error, ErrorKind};

/// Address family of a datagram socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl Family {
    /// The family an endpoint belongs to.
    pub fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(..) => Family::V4,
            SocketAddr::V6(..) => Family::V6,
        }
    }
}

/// Parse an endpoint string.
///
/// Accepted forms are `a.b.c.d:port`, `[v6]:port` and `[v6%zone]:port`,
/// where `zone` is a numeric interface index.
pub fn parse(s: &str) -> Result<SocketAddr, Error> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }

    // `[v6%zone]:port` - split the bracketed host from the port by hand,
    // since std rejects the zone.
    let rest = s
        .strip_prefix('[')
        .ok_or_else(|| Error::with_detail(ErrorKind::InvalidEndpoint, s))?;
    let (host, port) = rest
        .split_once("]:")
        .ok_or_else(|| Error::with_detail(ErrorKind::InvalidEndpoint, s))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::with_detail(ErrorKind::InvalidEndpoint, s))?;
    let (ip, scope) = parse_v6(host)?;
    Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope)))
}

/// Parse a bare address, with an optional `%zone` suffix on IPv6.
pub fn parse_addr(s: &str) -> Result<IpAddr, Error> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(ip);
    }
    let (ip, _scope) = parse_v6(s)?;
    Ok(IpAddr::V6(ip))
}

fn parse_v6(s: &str) -> Result<(Ipv6Addr, u32), Error> {
    let (host, zone) = match s.split_once('%') {
        Some((host, zone)) => {
            let zone: u32 = zone
                .parse()
                .map_err(|_| Error::with_detail(ErrorKind::InvalidEndpoint, s))?;
            (host, zone)
        }
        None => (s, 0),
    };
    let ip: Ipv6Addr = host
        .parse()
        .map_err(|_| Error::with_detail(ErrorKind::InvalidEndpoint, s))?;
    Ok((ip, zone))
}

/// The wildcard endpoint of the given family with port 0.
pub fn any(family: Family) -> SocketAddr {
    match family {
        Family::V4 => SocketAddr::V4(SocketAddrV4::new([0, 0, 0, 0].into(), 0)),
        Family::V6 => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_with_port() {
        let ep = parse("127.0.0.1:8080").unwrap();
        assert_eq!(Family::of(&ep), Family::V4);
        assert_eq!(ep.port(), 8080);
    }

    #[test]
    fn v6_bracketed() {
        let ep = parse("[::1]:443").unwrap();
        assert_eq!(Family::of(&ep), Family::V6);
        assert_eq!(ep.port(), 443);
    }

    #[test]
    fn v6_with_zone() {
        let ep = parse("[fe80::1%5]:443").unwrap();
        match ep {
            SocketAddr::V6(v6) => {
                assert_eq!(v6.scope_id(), 5);
                assert_eq!(v6.port(), 443);
            }
            SocketAddr::V4(..) => panic!("parsed as v4"),
        }
        let ip = parse_addr("fe80::1%5").unwrap();
        assert!(matches!(ip, IpAddr::V6(..)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("not an endpoint").is_err());
        assert!(parse("[::1]").is_err());
        assert!(parse("[fe80::1%eth0]:443").is_err());
    }
}
