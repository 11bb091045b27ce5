//! Throwaway self-signed certificates.
//!
//! Generated once per server start for `tls.source = "adhoc"`. Browsers will
//! warn about them; they only exist so a developer can exercise HTTPS code
//! paths locally.

use std::io::Write;
use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use tempfile::TempPath;
use time::{Duration, OffsetDateTime};

use crate::tls::TlsError;

const ORGANIZATION: &str = "Dummy Certificate";
const VALIDITY_DAYS: i64 = 365;

/// A PEM certificate and its PEM private key.
#[derive(Debug, Clone)]
pub struct AdhocPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate a self-signed ECDSA P-256 certificate valid for one year.
///
/// The subject (and issuer) is `CN=<common_name or "*">, O=Dummy Certificate`
/// and the serial is a random positive 63-bit integer.
pub fn generate_adhoc_pair(common_name: Option<&str>) -> Result<AdhocPair, rcgen::Error> {
    let cn = common_name.unwrap_or("*");

    let mut params = CertificateParams::new(vec![cn.to_string()])?;
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, cn);
    subject.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = subject;

    let serial = (rand::random::<u64>() >> 1).max(1);
    params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(AdhocPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// An ad-hoc pair written to temporary files.
///
/// Both files are removed when this value is dropped.
#[derive(Debug)]
pub struct AdhocCertificate {
    pair: AdhocPair,
    cert_path: TempPath,
    key_path: TempPath,
}

impl AdhocCertificate {
    pub fn generate(common_name: Option<&str>) -> Result<Self, TlsError> {
        let pair = generate_adhoc_pair(common_name)?;
        let cert_path = write_temp(".crt", &pair.cert_pem)?;
        let key_path = write_temp(".key", &pair.key_pem)?;
        tracing::debug!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Generated ad-hoc certificate"
        );
        Ok(Self {
            pair,
            cert_path,
            key_path,
        })
    }

    pub fn pair(&self) -> &AdhocPair {
        &self.pair
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }
}

fn write_temp(suffix: &str, contents: &str) -> Result<TempPath, TlsError> {
    let mut file = tempfile::Builder::new()
        .prefix("devserver-adhoc-")
        .suffix(suffix)
        .tempfile()
        .map_err(TlsError::TempFile)?;
    file.write_all(contents.as_bytes())
        .and_then(|_| file.flush())
        .map_err(TlsError::TempFile)?;
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_pem_encoded() {
        let pair = generate_adhoc_pair(Some("localhost")).unwrap();
        assert!(pair.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(pair.key_pem.contains("PRIVATE KEY-----"));
    }

    #[test]
    fn temp_files_live_as_long_as_the_certificate() {
        let cert = AdhocCertificate::generate(None).unwrap();
        let cert_path = cert.cert_path().to_path_buf();
        let key_path = cert.key_path().to_path_buf();

        assert_eq!(std::fs::read_to_string(&cert_path).unwrap(), cert.pair().cert_pem);
        assert!(key_path.exists());

        drop(cert);
        assert!(!cert_path.exists());
        assert!(!key_path.exists());
    }
}
