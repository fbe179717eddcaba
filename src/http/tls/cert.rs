//! Certificate sources
//!
//! Loads a PKCS#12 keystore or generates a throwaway self-signed
//! certificate so the server can run without any provisioning.

use super::TlsError;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509};
use std::fs;
use std::path::Path;

/// Certificate material ready to install into an SSL context
pub struct CertBundle {
    pub cert: X509,
    pub key: PKey<Private>,
    pub chain: Vec<X509>,
}

impl CertBundle {
    /// Load certificate and key from a PKCS#12 keystore file
    pub fn from_pkcs12(path: &Path, password: &str) -> Result<Self, TlsError> {
        let der = fs::read(path)?;
        let pkcs12 = Pkcs12::from_der(&der)
            .map_err(|e| TlsError::Keystore(format!("Unreadable PKCS#12 file: {}", e)))?;
        let parsed = pkcs12
            .parse2(password)
            .map_err(|e| TlsError::Keystore(format!("Failed to open keystore: {}", e)))?;

        let cert = parsed
            .cert
            .ok_or_else(|| TlsError::Keystore("Keystore contains no certificate".to_string()))?;
        let key = parsed
            .pkey
            .ok_or_else(|| TlsError::Keystore("Keystore contains no private key".to_string()))?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        Ok(CertBundle { cert, key, chain })
    }

    /// Generate a fresh self-signed certificate (RSA 2048, one year)
    pub fn generate_self_signed() -> Result<Self, TlsError> {
        let rsa = Rsa::generate(2048)?;
        let key = PKey::from_rsa(rsa)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, "localhost")?;
        let name = name.build();

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
        builder.set_serial_number(serial.to_asn1_integer()?.as_ref())?;

        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(365)?.as_ref())?;

        let san = SubjectAlternativeName::new()
            .dns("localhost")
            .ip("127.0.0.1")
            .build(&builder.x509v3_context(None, None))?;
        builder.append_extension(san)?;

        builder.sign(&key, MessageDigest::sha256())?;

        Ok(CertBundle {
            cert: builder.build(),
            key,
            chain: Vec::new(),
        })
    }
}
