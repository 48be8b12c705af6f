//! The stateless cookie exchange.
//!
//! The listener answers an uncookied client-hello with a crafted
//! hello-verify-request and admits a peer only once the echoed cookie
//! recomputes against its address. Nothing here allocates per-peer state;
//! the cookie is pure computation over the datagram and the peer address.

use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Per-process cookie secret: 16 uniformly random bytes drawn at listener
/// startup.
pub(crate) const SECRET_LEN: usize = 16;

pub(crate) const COOKIE_LEN: usize = 32;

const CONTENT_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_HELLO_VERIFY_REQUEST: u8 = 3;

// Record and handshake header sizes on the wire.
const RECORD_HEADER_LEN: usize = 13;
const HANDSHAKE_HEADER_LEN: usize = 12;

/// The cookie for one peer: the keyed hash of its address blob (family,
/// address bytes, port, v6 scope) under the secret.
pub(crate) fn compute(secret: &[u8; SECRET_LEN], peer: &SocketAddr) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&peer_blob(peer));
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time check that `cookie` recomputes for `peer`.
pub(crate) fn verify(secret: &[u8; SECRET_LEN], peer: &SocketAddr, cookie: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&peer_blob(peer));
    mac.verify_slice(cookie).is_ok()
}

fn peer_blob(peer: &SocketAddr) -> Vec<u8> {
    let mut blob = Vec::with_capacity(24);
    match peer {
        SocketAddr::V4(addr) => {
            blob.push(4);
            blob.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            blob.push(6);
            blob.extend_from_slice(&addr.ip().octets());
            blob.extend_from_slice(&addr.scope_id().to_be_bytes());
        }
    }
    blob.extend_from_slice(&peer.port().to_be_bytes());
    blob
}

/// The fields of a client-hello this layer cares about, plus the spans
/// needed to rewrite it.
#[derive(Debug)]
pub(crate) struct ClientHello<'a> {
    pub(crate) message_seq: u16,
    pub(crate) cookie: &'a [u8],
    // Handshake body split around the cookie field.
    body_before_cookie: &'a [u8],
    body_after_cookie: &'a [u8],
}

/// Parse the first record of a datagram as a DTLS client-hello. Anything
/// else - other content types, fragments, malformed lengths - is `None`;
/// the listener ignores such datagrams.
pub(crate) fn parse_client_hello(datagram: &[u8]) -> Option<ClientHello<'_>> {
    if datagram.len() < RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN {
        return None;
    }
    if datagram[0] != CONTENT_HANDSHAKE || datagram[1] != 254 {
        return None;
    }
    let record_len = u16::from_be_bytes([datagram[11], datagram[12]]) as usize;
    let record = datagram.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len)?;

    if record[0] != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let msg_len = u32::from_be_bytes([0, record[1], record[2], record[3]]) as usize;
    let message_seq = u16::from_be_bytes([record[4], record[5]]);
    let frag_offset = u32::from_be_bytes([0, record[6], record[7], record[8]]);
    let frag_len = u32::from_be_bytes([0, record[9], record[10], record[11]]) as usize;
    // Reassembly is out of scope; a hello must arrive whole.
    if frag_offset != 0 || frag_len != msg_len {
        return None;
    }
    let body = record.get(HANDSHAKE_HEADER_LEN..HANDSHAKE_HEADER_LEN + msg_len)?;

    // client_version(2) random(32) session_id cookie ...
    let mut at = 2 + 32;
    let session_id_len = *body.get(at)? as usize;
    at += 1 + session_id_len;
    let cookie_len = *body.get(at)? as usize;
    let cookie_at = at;
    at += 1;
    let cookie = body.get(at..at + cookie_len)?;
    at += cookie_len;
    if at > body.len() {
        return None;
    }

    Some(ClientHello {
        message_seq,
        cookie,
        body_before_cookie: &body[..cookie_at],
        body_after_cookie: &body[cookie_at + 1 + cookie_len..],
    })
}

/// Craft the hello-verify-request answering an uncookied hello.
pub(crate) fn hello_verify_request(cookie: &[u8]) -> Vec<u8> {
    debug_assert!(cookie.len() <= u8::MAX as usize);
    let body_len = 2 + 1 + cookie.len();
    let record_len = HANDSHAKE_HEADER_LEN + body_len;

    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + record_len);
    // Record header; the verify request carries DTLS 1.0 on the wire
    // regardless of the negotiated version.
    out.push(CONTENT_HANDSHAKE);
    out.extend_from_slice(&[254, 255]);
    out.extend_from_slice(&[0, 0]); // epoch
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // sequence
    out.extend_from_slice(&(record_len as u16).to_be_bytes());
    // Handshake header.
    out.push(HANDSHAKE_HELLO_VERIFY_REQUEST);
    out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&[0, 0]); // message_seq
    out.extend_from_slice(&[0, 0, 0]); // fragment_offset
    out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
    // Body.
    out.extend_from_slice(&[254, 255]);
    out.push(cookie.len() as u8);
    out.extend_from_slice(cookie);
    out
}

/// Rebuild the verified hello as the exchange's *initial* hello: cookie
/// stripped, message sequence zero. Replaying this to a fresh engine (and
/// discarding the hello-verify flight it answers with) brings the engine's
/// handshake sequence in line with the client's, while DTLS excludes both
/// replayed messages from the Finished MAC.
pub(crate) fn synthesize_initial_hello(hello: &ClientHello<'_>) -> Vec<u8> {
    let body_len = hello.body_before_cookie.len() + 1 + hello.body_after_cookie.len();
    let record_len = HANDSHAKE_HEADER_LEN + body_len;

    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + record_len);
    out.push(CONTENT_HANDSHAKE);
    out.extend_from_slice(&[254, 255]);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&(record_len as u16).to_be_bytes());
    out.push(HANDSHAKE_CLIENT_HELLO);
    out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&[0, 0]); // message_seq 0
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
    out.extend_from_slice(hello.body_before_cookie);
    out.push(0); // empty cookie
    out.extend_from_slice(hello.body_after_cookie);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hello(message_seq: u16, cookie: &[u8]) -> Vec<u8> {
        let session_id: &[u8] = &[];
        let suites: &[u8] = &[0x00, 0x02, 0xc0, 0x2b, 0x01, 0x00];
        let body_len = 2 + 32 + 1 + session_id.len() + 1 + cookie.len() + suites.len();
        let record_len = HANDSHAKE_HEADER_LEN + body_len;

        let mut out = Vec::new();
        out.push(CONTENT_HANDSHAKE);
        out.extend_from_slice(&[254, 253]);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&[0, 0, 0, 0, 0, 7]);
        out.extend_from_slice(&(record_len as u16).to_be_bytes());
        out.push(HANDSHAKE_CLIENT_HELLO);
        out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
        out.extend_from_slice(&message_seq.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
        out.extend_from_slice(&[254, 253]); // client_version
        out.extend_from_slice(&[0x42; 32]); // random
        out.push(session_id.len() as u8);
        out.extend_from_slice(session_id);
        out.push(cookie.len() as u8);
        out.extend_from_slice(cookie);
        out.extend_from_slice(suites);
        out
    }

    #[test]
    fn cookie_is_deterministic_per_peer() {
        let secret = [7u8; SECRET_LEN];
        let a: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        let cookie = compute(&secret, &a);
        assert_eq!(cookie.len(), COOKIE_LEN);
        assert_eq!(cookie, compute(&secret, &a));
        assert_ne!(cookie, compute(&secret, &b));
        assert!(verify(&secret, &a, &cookie));
        assert!(!verify(&secret, &b, &cookie));
        assert!(!verify(&secret, &a, &[0u8; COOKIE_LEN]));
    }

    #[test]
    fn parses_client_hello() {
        let datagram = sample_hello(1, b"abcdef");
        let hello = parse_client_hello(&datagram).unwrap();
        assert_eq!(hello.message_seq, 1);
        assert_eq!(hello.cookie, b"abcdef");
    }

    #[test]
    fn rejects_non_hello() {
        let mut datagram = sample_hello(0, &[]);
        datagram[0] = 23; // application data
        assert!(parse_client_hello(&datagram).is_none());
        assert!(parse_client_hello(&[0u8; 8]).is_none());

        // Truncated record.
        let datagram = sample_hello(0, b"abc");
        assert!(parse_client_hello(&datagram[..datagram.len() - 4]).is_none());
    }

    #[test]
    fn synthesized_hello_drops_cookie_and_seq() {
        let datagram = sample_hello(1, b"cookiecookie");
        let hello = parse_client_hello(&datagram).unwrap();
        let initial = synthesize_initial_hello(&hello);
        let reparsed = parse_client_hello(&initial).unwrap();
        assert_eq!(reparsed.message_seq, 0);
        assert!(reparsed.cookie.is_empty());
        // Everything around the cookie is carried over verbatim.
        assert_eq!(reparsed.body_before_cookie, hello.body_before_cookie);
        assert_eq!(reparsed.body_after_cookie, hello.body_after_cookie);
    }

    #[test]
    fn hello_verify_request_shape() {
        let cookie = [0xabu8; COOKIE_LEN];
        let hvr = hello_verify_request(&cookie);
        assert_eq!(hvr[0], CONTENT_HANDSHAKE);
        assert_eq!(&hvr[1..3], &[254, 255]);
        assert_eq!(hvr[13], HANDSHAKE_HELLO_VERIFY_REQUEST);
        // Cookie is the trailing bytes, length-prefixed.
        assert_eq!(hvr[hvr.len() - 1 - COOKIE_LEN] as usize, COOKIE_LEN);
        assert_eq!(&hvr[hvr.len() - COOKIE_LEN..], &cookie);
    }
}
