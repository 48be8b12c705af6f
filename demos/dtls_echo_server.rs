//! DTLS 1.2 echo server with the stateless cookie exchange.
//!
//! Usage: `dtls_echo_server [port] [-v]` (default 4433). Peers present any
//! certificate; self-signed is accepted. Without `--cert`/`--key` PEM paths
//! a throwaway self-signed identity is generated at startup. Stop with
//! SIGINT; exits non-zero if the key, certificate, or socket setup fails.

use std::net::SocketAddr;
use std::sync::OnceLock;

use udio::dtls::{DtlsContext, DtlsListener, DtlsSession, VerifyPolicy};
use udio::{ErrorKind, EventLoop, Stopper};

static STOPPER: OnceLock<Stopper> = OnceLock::new();

const BUFFER: usize = 16 * 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut port: u16 = 4433;
    let mut verbose = false;
    let mut cert_path: Option<String> = None;
    let mut key_path: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "--cert" => cert_path = args.next(),
            "--key" => key_path = args.next(),
            other => port = other.parse()?,
        }
    }
    env_logger::Builder::from_default_env()
        .filter_level(if verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        })
        .init();

    let (cert_pem, key_pem) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => (std::fs::read(cert)?, std::fs::read(key)?),
        _ => self_signed_identity()?,
    };
    let context = DtlsContext::builder()
        .identity(&cert_pem, &key_pem)
        .verify(VerifyPolicy::allow_self_signed())
        .build()?;

    let addr: SocketAddr = format!("[::]:{}", port).parse()?;
    let event_loop = EventLoop::new()?;
    let _ = STOPPER.set(event_loop.stopper());
    install_signal_handlers();

    let listener = DtlsListener::bind(&event_loop, addr, context)?;
    println!("dtls echo on {}", listener.local_addr());

    accept(listener);
    event_loop.run()?;
    println!("bye");
    Ok(())
}

fn accept(listener: DtlsListener) {
    let next = listener.clone();
    listener.accept(move |result| {
        match result {
            Ok(session) => {
                println!("cookie verified for {}", session.peer_addr());
                let on_handshake = session.clone();
                session.handshake(move |result| match result {
                    Ok(()) => {
                        println!("handshake complete with {}", on_handshake.peer_addr());
                        echo(on_handshake);
                    }
                    Err(err) => eprintln!("handshake failed: {}", err),
                });
                // Keep admitting other peers while this one handshakes.
                accept(next);
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => {}
            Err(err) => eprintln!("accept failed: {}", err),
        }
    });
}

fn echo(session: DtlsSession) {
    let writer = session.clone();
    session.read(vec![0; BUFFER], move |result, mut buf| {
        match result {
            Ok(n) => {
                buf.truncate(n);
                let reader = writer.clone();
                writer.write(buf, move |result, _| {
                    if let Err(err) = result {
                        eprintln!("write failed: {}", err);
                        return;
                    }
                    echo(reader);
                });
            }
            Err(err) if err.kind() == ErrorKind::PeerClosed => {
                println!("{} closed the session", writer.peer_addr());
                writer.close();
            }
            Err(err) => {
                eprintln!("read failed: {}", err);
                writer.close();
            }
        }
    });
}

/// A throwaway identity so the demo runs without any PEM files on disk.
fn self_signed_identity() -> Result<(Vec<u8>, Vec<u8>), Box<dyn std::error::Error>> {
    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509NameBuilder, X509};

    let key = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", "dtls-echo-server")?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(30)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(&key)?;
    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    Ok((cert.to_pem()?, key.private_key_to_pem_pkcs8()?))
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
