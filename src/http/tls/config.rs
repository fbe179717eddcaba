//! Server TLS context
//!
//! One `SslContext` is built at startup and shared read-only by every
//! acceptor and worker. When HTTP/2 is enabled the context advertises
//! [h2, http/1.1] through an ALPN selection callback and restricts cipher
//! suites to the HTTP/2-approved set, as ALPN-negotiated h2 requires.

use super::cert::CertBundle;
use super::{ALPN_H2, ALPN_HTTP11};
use crate::config::CertSource;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVersion};
use std::net::TcpStream;
use tracing::info;

/// TLS 1.2 cipher suites acceptable for HTTP/2 (RFC 7540 Appendix A leaves
/// these off its black list); TLS 1.3 suites are governed separately
const HTTP2_CIPHER_LIST: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:\
ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-AES256-GCM-SHA384:\
ECDHE-RSA-AES256-GCM-SHA384";

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Immutable server TLS context
pub struct TlsContext {
    pub(crate) ctx: SslContext,
}

impl TlsContext {
    /// Build the server context from the configured certificate source
    ///
    /// Errors here are startup-fatal; the caller must not begin listening.
    pub fn from_cert_source(source: &CertSource, http2: bool) -> Result<Self, TlsError> {
        let bundle = match source {
            CertSource::Keystore { path, password } => {
                info!(keystore = %path.display(), "Creating TLS context from keystore");
                CertBundle::from_pkcs12(path, password)?
            }
            CertSource::SelfSigned => {
                info!("Creating TLS context with a generated self-signed certificate");
                CertBundle::generate_self_signed()?
            }
        };

        let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
        builder.set_certificate(&bundle.cert)?;
        builder.set_private_key(&bundle.key)?;
        for extra in &bundle.chain {
            builder.add_extra_chain_cert(extra.clone())?;
        }
        builder.check_private_key()?;

        if http2 {
            // ALPN requires TLS 1.2+ and the restricted cipher set
            builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
            builder.set_cipher_list(HTTP2_CIPHER_LIST)?;
            Self::configure_alpn(&mut builder, &[ALPN_H2, ALPN_HTTP11]);
        }

        Ok(TlsContext {
            ctx: builder.build(),
        })
    }

    /// Install the server-side ALPN selection callback
    ///
    /// Picks the first of our protocols, in preference order, that the
    /// client offered. A client with no overlap proceeds without ALPN and
    /// lands on HTTP/1.1.
    fn configure_alpn(builder: &mut SslContextBuilder, protocols: &[&str]) {
        let ours: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

        builder.set_alpn_select_callback(move |_ssl, client_protos| {
            for preferred in &ours {
                let mut pos = 0;
                while pos < client_protos.len() {
                    let len = client_protos[pos] as usize;
                    pos += 1;
                    if pos + len > client_protos.len() {
                        break;
                    }
                    let client_proto = &client_protos[pos..pos + len];
                    if client_proto == preferred.as_slice() {
                        return Ok(client_proto);
                    }
                    pos += len;
                }
            }
            Err(openssl::ssl::AlpnError::NOACK)
        });
    }

    /// Accept a client connection, performing the TLS handshake
    pub fn accept(&self, stream: TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        super::session::TlsSessionOps::accept(stream, &self.ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_context_from_self_signed() {
        let ctx = TlsContext::from_cert_source(&CertSource::SelfSigned, false);
        assert!(ctx.is_ok());
    }

    #[test]
    fn test_context_with_alpn() {
        let ctx = TlsContext::from_cert_source(&CertSource::SelfSigned, true);
        assert!(ctx.is_ok());
    }

    #[test]
    fn test_bad_keystore_is_fatal() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"this is not a keystore").unwrap();

        let source = CertSource::Keystore {
            path: file.path().to_path_buf(),
            password: "whatever".to_string(),
        };
        let result = TlsContext::from_cert_source(&source, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_keystore_file_is_fatal() {
        let source = CertSource::Keystore {
            path: "/nonexistent/keystore.p12".into(),
            password: "".to_string(),
        };
        let result = TlsContext::from_cert_source(&source, false);
        assert!(matches!(result, Err(TlsError::Io(_))));
    }
}
