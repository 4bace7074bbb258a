use std::path::Path;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::PkiError;

/// A leaf certificate issued by one of the CAs.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    /// SHA-256 hex over the DER bytes; the device-auth association key.
    pub fingerprint: String,
}

/// An issuing certificate authority (SCEP CA for Apple, WSTEP CA for
/// Windows). The private key never leaves the server; the same key pair is
/// reused to open disk-encryption escrow envelopes.
pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed CA.
    pub fn generate(common_name: &str, org: &str) -> Result<Self, PkiError> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, org);
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let key = KeyPair::generate().map_err(|e| PkiError::Issue(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| PkiError::Issue(e.to_string()))?;
        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();
        Ok(Self { cert, key, cert_pem, key_pem })
    }

    /// Load the CA from `<dir>/<stem>.crt` and `<dir>/<stem>.key`, generating
    /// and persisting a fresh one when either file is missing.
    pub fn load_or_generate(
        dir: &Path,
        stem: &str,
        common_name: &str,
        org: &str,
    ) -> Result<Self, PkiError> {
        let cert_path = dir.join(format!("{}.crt", stem));
        let key_path = dir.join(format!("{}.key", stem));

        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path).map_err(|e| PkiError::Io {
                path: cert_path.display().to_string(),
                source: e,
            })?;
            let key_pem = std::fs::read_to_string(&key_path).map_err(|e| PkiError::Io {
                path: key_path.display().to_string(),
                source: e,
            })?;
            return Self::from_pem(&cert_pem, &key_pem);
        }

        info!(stem, "generating new certificate authority");
        std::fs::create_dir_all(dir).map_err(|e| PkiError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let ca = Self::generate(common_name, org)?;
        std::fs::write(&cert_path, &ca.cert_pem).map_err(|e| PkiError::Io {
            path: cert_path.display().to_string(),
            source: e,
        })?;
        std::fs::write(&key_path, &ca.key_pem).map_err(|e| PkiError::Io {
            path: key_path.display().to_string(),
            source: e,
        })?;
        Ok(ca)
    }

    /// Rehydrate from persisted PEM material.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, PkiError> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| PkiError::Pem(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| PkiError::Parse(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| PkiError::Issue(e.to_string()))?;
        Ok(Self {
            cert,
            key,
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        self.cert.der()
    }

    /// Sign a PKCS#10 request, producing a one-year device identity cert.
    pub fn issue_from_csr(&self, csr_der: &[u8]) -> Result<IssuedCert, PkiError> {
        let mut params = CertificateSigningRequestParams::from_der(&csr_der.to_vec().into())
            .map_err(|e| PkiError::Parse(e.to_string()))?;
        let now = time::OffsetDateTime::now_utc();
        params.params.not_before = now;
        params.params.not_after = now + time::Duration::days(365);
        let cert = params
            .signed_by(&self.cert, &self.key)
            .map_err(|e| PkiError::Issue(e.to_string()))?;
        let cert_der = cert.der().to_vec();
        let fingerprint = fingerprint(&cert_der);
        Ok(IssuedCert { cert_pem: cert.pem(), cert_der, fingerprint })
    }
}

/// SHA-256 hex fingerprint over certificate DER bytes.
pub fn fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Parse a PEM- or URL-encoded client certificate as forwarded by the proxy
/// layer, returning its DER bytes.
pub fn client_cert_der(header_value: &str) -> Result<Vec<u8>, PkiError> {
    let decoded = percent_decode(header_value);
    let parsed = pem::parse(decoded.as_bytes()).map_err(|e| PkiError::Pem(e.to_string()))?;
    Ok(parsed.contents().to_vec())
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_rehydrate() {
        let ca = CertificateAuthority::generate("Test SCEP CA", "Shepherd").unwrap();
        let again = CertificateAuthority::from_pem(ca.cert_pem(), ca.key_pem()).unwrap();
        assert!(!again.cert_der().is_empty());
    }

    #[test]
    fn load_or_generate_persists_material() {
        let dir = tempfile::tempdir().unwrap();
        let a = CertificateAuthority::load_or_generate(dir.path(), "scep", "CA", "Org").unwrap();
        let b = CertificateAuthority::load_or_generate(dir.path(), "scep", "CA", "Org").unwrap();
        assert_eq!(a.cert_pem(), b.cert_pem());
    }

    #[test]
    fn issues_cert_from_csr() {
        let ca = CertificateAuthority::generate("Test CA", "Shepherd").unwrap();

        let device_key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, "device-1");
        params.distinguished_name = dn;
        let csr = params.serialize_request(&device_key).unwrap();

        let issued = ca.issue_from_csr(csr.der()).unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(issued.fingerprint.len(), 64);

        let (_, parsed) = x509_parser::parse_x509_certificate(&issued.cert_der).unwrap();
        assert!(parsed.subject().to_string().contains("device-1"));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
    }
}
