//! Certificate material and verification policy.
//!
//! A [`DtlsContext`] consumes a PEM certificate chain + private key and PEM
//! trust anchors as opaque byte sequences - no path discovery, no parsing
//! beyond what the TLS library needs - and carries the peer-verification
//! policy. Contexts are immutable once built and cheap to clone; build one
//! before `run()` and share it across sessions.

use std::fmt;
use std::sync::Arc;

use openssl::pkey::PKey;
use openssl::ssl::{SslContext, SslMethod, SslOptions, SslVerifyMode};
use openssl::x509::X509;

use crate::error::{Error, ErrorKind, Result};

use super::engine;

const DEFAULT_MTU: u32 = 1400;

/// What the verification callback gets to judge for each certificate in
/// the peer's chain.
#[derive(Debug)]
pub struct VerifyInfo {
    /// The TLS library's own verdict for this certificate.
    pub preverified: bool,
    /// Depth in the chain; 0 is the peer's own certificate.
    pub depth: u32,
    /// Subject name of the certificate under consideration.
    pub subject: String,
    /// Raw verification error code when `preverified` is false.
    pub error: i32,
}

/// Per-certificate acceptance policy.
#[derive(Clone)]
pub struct VerifyPolicy(Arc<dyn Fn(&VerifyInfo) -> bool + Send + Sync>);

impl VerifyPolicy {
    /// Accept only chains the trust store validates.
    pub fn strict() -> VerifyPolicy {
        VerifyPolicy(Arc::new(|info: &VerifyInfo| info.preverified))
    }

    /// Accept trust-store-valid chains, plus peers presenting a
    /// self-signed certificate.
    pub fn allow_self_signed() -> VerifyPolicy {
        VerifyPolicy(Arc::new(|info: &VerifyInfo| {
            info.preverified
                || info.error == openssl_sys::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT
                || info.error == openssl_sys::X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN
        }))
    }

    /// Judge each certificate with `f`.
    pub fn custom<F>(f: F) -> VerifyPolicy
    where
        F: Fn(&VerifyInfo) -> bool + Send + Sync + 'static,
    {
        VerifyPolicy(Arc::new(f))
    }
}

impl fmt::Debug for VerifyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyPolicy").finish()
    }
}

/// Builder for [`DtlsContext`].
#[derive(Debug)]
pub struct DtlsContextBuilder {
    identity: Option<(Vec<u8>, Vec<u8>)>,
    trust: Vec<Vec<u8>>,
    policy: VerifyPolicy,
    require_peer_certificate: bool,
    mtu: u32,
}

impl DtlsContextBuilder {
    /// This side's certificate chain and private key, PEM-encoded. Required
    /// for servers; optional for clients.
    pub fn identity(mut self, cert_chain_pem: &[u8], key_pem: &[u8]) -> DtlsContextBuilder {
        self.identity = Some((cert_chain_pem.to_vec(), key_pem.to_vec()));
        self
    }

    /// Add PEM trust anchors the peer's chain is verified against.
    pub fn trust_anchors(mut self, pem: &[u8]) -> DtlsContextBuilder {
        self.trust.push(pem.to_vec());
        self
    }

    /// The acceptance policy consulted for each certificate in the peer's
    /// chain. Defaults to [`VerifyPolicy::strict`].
    pub fn verify(mut self, policy: VerifyPolicy) -> DtlsContextBuilder {
        self.policy = policy;
        self
    }

    /// Demand a certificate from the peer (servers requesting client
    /// certificates). Default on.
    pub fn require_peer_certificate(mut self, on: bool) -> DtlsContextBuilder {
        self.require_peer_certificate = on;
        self
    }

    /// Path MTU the engine sizes its handshake flights to. Default 1400.
    pub fn mtu(mut self, mtu: u32) -> DtlsContextBuilder {
        self.mtu = mtu;
        self
    }

    /// Build the immutable context.
    pub fn build(self) -> Result<DtlsContext> {
        let mut builder = SslContext::builder(SslMethod::dtls()).map_err(build_error)?;

        // The engine runs over an in-memory transport with no MTU of its
        // own, and servers walk the cookie-exchange path the session layer
        // fronts (see the listener).
        builder.set_options(SslOptions::COOKIE_EXCHANGE | SslOptions::NO_QUERY_MTU);

        if let Some((cert_pem, key_pem)) = &self.identity {
            let mut chain = X509::stack_from_pem(cert_pem).map_err(build_error)?.into_iter();
            let leaf = chain.next().ok_or_else(|| {
                Error::with_detail(ErrorKind::InvalidState, "identity PEM holds no certificate")
            })?;
            builder.set_certificate(&leaf).map_err(build_error)?;
            for intermediate in chain {
                builder
                    .add_extra_chain_cert(intermediate)
                    .map_err(build_error)?;
            }
            let key = PKey::private_key_from_pem(key_pem).map_err(build_error)?;
            builder.set_private_key(&key).map_err(build_error)?;
            builder.check_private_key().map_err(build_error)?;
        }

        for pem in &self.trust {
            for anchor in X509::stack_from_pem(pem).map_err(build_error)? {
                builder
                    .cert_store_mut()
                    .add_cert(anchor)
                    .map_err(build_error)?;
            }
        }

        let mut mode = SslVerifyMode::PEER;
        if self.require_peer_certificate {
            mode |= SslVerifyMode::FAIL_IF_NO_PEER_CERT;
        }
        let policy = self.policy.clone();
        builder.set_verify_callback(mode, move |preverified, x509_ctx| {
            let info = VerifyInfo {
                preverified,
                depth: x509_ctx.error_depth(),
                subject: x509_ctx
                    .current_cert()
                    .map(|cert| subject_string(cert.subject_name()))
                    .unwrap_or_default(),
                error: x509_ctx.error().as_raw(),
            };
            (policy.0)(&info)
        });

        let ctx = builder.build();
        engine::install_cookie_callbacks(&ctx);

        Ok(DtlsContext {
            ctx,
            mtu: self.mtu,
        })
    }
}

/// Immutable TLS configuration shared by sessions and listeners.
#[derive(Clone)]
pub struct DtlsContext {
    ctx: SslContext,
    mtu: u32,
}

impl DtlsContext {
    /// Start building a context.
    pub fn builder() -> DtlsContextBuilder {
        DtlsContextBuilder {
            identity: None,
            trust: Vec::new(),
            policy: VerifyPolicy::strict(),
            require_peer_certificate: true,
            mtu: DEFAULT_MTU,
        }
    }

    pub(crate) fn ssl_context(&self) -> &SslContext {
        &self.ctx
    }

    pub(crate) fn mtu(&self) -> u32 {
        self.mtu
    }
}

impl fmt::Debug for DtlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsContext").field("mtu", &self.mtu).finish()
    }
}

fn subject_string(name: &openssl::x509::X509NameRef) -> String {
    let mut out = String::new();
    for entry in name.entries() {
        if !out.is_empty() {
            out.push(',');
        }
        if let Ok(short) = entry.object().nid().short_name() {
            out.push_str(short);
            out.push('=');
        }
        if let Ok(value) = entry.data().as_utf8() {
            out.push_str(&value);
        }
    }
    out
}

fn build_error(err: openssl::error::ErrorStack) -> Error {
    Error::with_detail(ErrorKind::System, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies() {
        let ok = VerifyInfo {
            preverified: true,
            depth: 0,
            subject: "CN=peer".into(),
            error: 0,
        };
        let self_signed = VerifyInfo {
            preverified: false,
            depth: 0,
            subject: "CN=peer".into(),
            error: openssl_sys::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT,
        };
        assert!((VerifyPolicy::strict().0)(&ok));
        assert!(!(VerifyPolicy::strict().0)(&self_signed));
        assert!((VerifyPolicy::allow_self_signed().0)(&self_signed));
        let by_depth = VerifyPolicy::custom(|info| info.depth == 0);
        assert!((by_depth.0)(&self_signed));
    }

    #[test]
    fn builds_without_identity() {
        let context = DtlsContext::builder()
            .verify(VerifyPolicy::allow_self_signed())
            .build()
            .unwrap();
        assert_eq!(context.mtu(), DEFAULT_MTU);
    }
}
