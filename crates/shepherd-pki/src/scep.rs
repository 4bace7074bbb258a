//! SCEP issuance surface for Apple enrollment.
//!
//! The server advertises `POSTPKIOperation` and accepts the degenerate
//! PKIOperation form (a bare DER PKCS#10 request) that the managed enrollment
//! profile drives devices to. Challenge verification gates issuance; the
//! challenge is distributed inside the enrollment profile and echoed by the
//! client.

use crate::ca::{CertificateAuthority, IssuedCert};
use crate::error::PkiError;

pub const CA_CERT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";
pub const PKI_OPERATION_CONTENT_TYPE: &str = "application/x-pki-message";

pub struct ScepServer {
    ca: std::sync::Arc<CertificateAuthority>,
    challenge: String,
}

impl ScepServer {
    pub fn new(ca: std::sync::Arc<CertificateAuthority>, challenge: String) -> Self {
        Self { ca, challenge }
    }

    /// `GetCACaps` body.
    pub fn ca_caps(&self) -> &'static str {
        "POSTPKIOperation\nSHA-256\nAES"
    }

    /// `GetCACert` body.
    pub fn ca_cert_der(&self) -> Vec<u8> {
        self.ca.cert_der().to_vec()
    }

    /// `PKIOperation`: verify the challenge and sign the device CSR.
    pub fn issue(&self, csr_der: &[u8], challenge: &str) -> Result<IssuedCert, PkiError> {
        if challenge != self.challenge {
            return Err(PkiError::BadChallenge);
        }
        self.ca.issue_from_csr(csr_der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn server() -> ScepServer {
        let ca = CertificateAuthority::generate("SCEP CA", "Shepherd").unwrap();
        ScepServer::new(Arc::new(ca), "challenge".into())
    }

    fn csr_der() -> Vec<u8> {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::default();
        params.serialize_request(&key).unwrap().der().to_vec()
    }

    #[test]
    fn wrong_challenge_is_rejected() {
        let srv = server();
        assert!(matches!(
            srv.issue(&csr_der(), "nope"),
            Err(PkiError::BadChallenge)
        ));
    }

    #[test]
    fn valid_challenge_issues_cert() {
        let srv = server();
        let issued = srv.issue(&csr_der(), "challenge").unwrap();
        assert!(!issued.cert_der.is_empty());
    }

    #[test]
    fn caps_advertise_post_pki_operation() {
        assert!(server().ca_caps().contains("POSTPKIOperation"));
    }
}
