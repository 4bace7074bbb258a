//! Escrow envelope: encrypt-to-certificate for disk-encryption recovery keys.
//!
//! The envelope is an ECIES construction over the CA's P-256 key pair:
//! ephemeral ECDH → HKDF-SHA256 → AES-256-GCM. Only the holder of the CA
//! private key can open it.
//!
//! Wire layout: `[version:1][ephemeral SEC1 point:65][nonce:12][ciphertext]`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::pkcs8::DecodePrivateKey;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::PkiError;

const VERSION: u8 = 1;
const POINT_LEN: usize = 65;
const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"shepherd-escrow-v1";

/// Encrypt `plaintext` so that only the holder of the private key matching
/// `recipient_cert_pem` can recover it.
pub fn encrypt(recipient_cert_pem: &str, plaintext: &[u8]) -> Result<Vec<u8>, PkiError> {
    let recipient = public_key_from_cert_pem(recipient_cert_pem)?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_point = ephemeral.public_key().to_sec1_bytes();
    let shared = ephemeral.diffie_hellman(&recipient);

    let key = derive_key(shared.raw_secret_bytes().as_slice())?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| PkiError::Envelope(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| PkiError::Envelope(e.to_string()))?;

    let mut out = Vec::with_capacity(1 + POINT_LEN + NONCE_LEN + ciphertext.len());
    out.push(VERSION);
    out.extend_from_slice(&ephemeral_point);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope with the CA private key (PKCS#8 PEM).
pub fn decrypt(recipient_key_pem: &str, envelope: &[u8]) -> Result<Vec<u8>, PkiError> {
    if envelope.len() < 1 + POINT_LEN + NONCE_LEN {
        return Err(PkiError::Envelope("envelope too short".into()));
    }
    if envelope[0] != VERSION {
        return Err(PkiError::Envelope(format!(
            "unsupported envelope version {}",
            envelope[0]
        )));
    }
    let point = &envelope[1..1 + POINT_LEN];
    let nonce = &envelope[1 + POINT_LEN..1 + POINT_LEN + NONCE_LEN];
    let ciphertext = &envelope[1 + POINT_LEN + NONCE_LEN..];

    let secret = SecretKey::from_pkcs8_pem(recipient_key_pem)
        .map_err(|e| PkiError::Pem(e.to_string()))?;
    let ephemeral = PublicKey::from_sec1_bytes(point)
        .map_err(|e| PkiError::Envelope(e.to_string()))?;
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());

    let key = derive_key(shared.raw_secret_bytes().as_slice())?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| PkiError::Envelope(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| PkiError::Envelope("decryption failed".into()))
}

fn derive_key(shared: &[u8]) -> Result<[u8; 32], PkiError> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|e| PkiError::Envelope(e.to_string()))?;
    Ok(okm)
}

fn public_key_from_cert_pem(cert_pem: &str) -> Result<PublicKey, PkiError> {
    let block = pem::parse(cert_pem.as_bytes()).map_err(|e| PkiError::Pem(e.to_string()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(block.contents())
        .map_err(|e| PkiError::Parse(e.to_string()))?;
    let spki = cert.public_key();
    PublicKey::from_sec1_bytes(&spki.subject_public_key.data)
        .map_err(|e| PkiError::Parse(format!("unsupported CA public key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;

    #[test]
    fn round_trip() {
        let ca = CertificateAuthority::generate("Escrow CA", "Shepherd").unwrap();
        let envelope = encrypt(ca.cert_pem(), b"ABC").unwrap();
        assert_ne!(envelope, b"ABC");
        let plain = decrypt(ca.key_pem(), &envelope).unwrap();
        assert_eq!(plain, b"ABC");
    }

    #[test]
    fn wrong_key_fails() {
        let ca = CertificateAuthority::generate("Escrow CA", "Shepherd").unwrap();
        let other = CertificateAuthority::generate("Other CA", "Shepherd").unwrap();
        let envelope = encrypt(ca.cert_pem(), b"secret").unwrap();
        assert!(decrypt(other.key_pem(), &envelope).is_err());
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let ca = CertificateAuthority::generate("Escrow CA", "Shepherd").unwrap();
        assert!(decrypt(ca.key_pem(), &[1, 2, 3]).is_err());
    }

    #[test]
    fn ciphertexts_are_randomized() {
        let ca = CertificateAuthority::generate("Escrow CA", "Shepherd").unwrap();
        let a = encrypt(ca.cert_pem(), b"same").unwrap();
        let b = encrypt(ca.cert_pem(), b"same").unwrap();
        assert_ne!(a, b);
    }
}
