//! Integrity and confidentiality for metric batches.
//!
//! Two independent, optional layers:
//!
//!  * a keyed signature (HMAC-SHA256 over the metric's canonical encoding)
//!    applied per metric when both ends share a secret, and
//!  * RSA-OAEP encryption of the serialized batch when a key pair is
//!    configured, chunked because RSA bounds the plaintext per operation.
//!
//! The layers compose: metrics are signed first, the whole batch is then
//! encrypted as one byte blob.

use hmac::{Hmac, Mac};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::metric::Metric;

type HmacSha256 = Hmac<Sha256>;

// OAEP consumes two SHA-256 digests plus two bytes of every block.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// Why a carried signature was rejected.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SignatureError {
    /// The carried signature is not decodable hex.
    Undecodable,
    /// The recomputed signature does not match the carried one.
    Mismatch,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SignatureError::Undecodable => f.write_str("failed to decode hash"),
            SignatureError::Mismatch => f.write_str("invalid hash"),
        }
    }
}

/// Compute the hex-encoded keyed signature of a metric.
///
/// Returns `None` when the metric has no canonical encoding, which only
/// happens for unsupported kinds or a missing value/delta.
pub fn sign(key: &str, metric: &Metric) -> Option<String> {
    let data = metric.canonical()?;
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Recompute a metric's signature and compare it against the carried one.
///
/// The comparison is constant-time. A metric without a `hash` field compares
/// like an empty signature and is rejected as a mismatch.
pub fn verify(key: &str, metric: &Metric) -> Result<(), SignatureError> {
    let carried = match metric.hash {
        Some(ref h) => h.as_str(),
        None => "",
    };
    let decoded = hex::decode(carried).map_err(|_| SignatureError::Undecodable)?;

    let data = metric.canonical().ok_or(SignatureError::Mismatch)?;
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    mac.verify_slice(&decoded)
        .map_err(|_| SignatureError::Mismatch)
}

/// Load an RSA public key from an SPKI PEM file.
pub fn load_public_key<P>(path: P) -> Result<RsaPublicKey, String>
where
    P: AsRef<Path>,
{
    let pem = fs::read_to_string(&path).map_err(|e| {
        format!(
            "failed to read public key {}: {}",
            path.as_ref().display(),
            e
        )
    })?;
    RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|e| format!("failed to parse public key: {}", e))
}

/// Load an RSA private key from a PKCS#1 PEM file.
pub fn load_private_key<P>(path: P) -> Result<RsaPrivateKey, String>
where
    P: AsRef<Path>,
{
    let pem = fs::read_to_string(&path).map_err(|e| {
        format!(
            "failed to read private key {}: {}",
            path.as_ref().display(),
            e
        )
    })?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .map_err(|e| format!("failed to parse private key: {}", e))
}

/// Encrypt a payload of any length with the receiver's public key.
///
/// The payload is split into blocks of `modulus - overhead` bytes, each
/// encrypted independently, and the ciphertext blocks are concatenated.
pub fn encrypt(key: &RsaPublicKey, msg: &[u8]) -> Result<Vec<u8>, String> {
    let mut rng = rand::thread_rng();
    let step = key.size() - OAEP_OVERHEAD;

    let mut ciphertext = Vec::with_capacity(msg.len() + OAEP_OVERHEAD);
    for block in msg.chunks(step) {
        let encrypted = key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), block)
            .map_err(|e| format!("failed to encrypt block: {}", e))?;
        ciphertext.extend_from_slice(&encrypted);
    }
    Ok(ciphertext)
}

/// Decrypt a chunked ciphertext with the private key.
///
/// The stride is the private key's modulus size, independent of whatever
/// chunking the sender used for the complementary operation. Any block that
/// fails to decrypt fails the whole payload.
pub fn decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, String> {
    let step = key.size();

    let mut msg = Vec::with_capacity(ciphertext.len());
    for block in ciphertext.chunks(step) {
        let decrypted = key
            .decrypt(Oaep::new::<Sha256>(), block)
            .map_err(|e| format!("failed to decrypt block: {}", e))?;
        msg.extend_from_slice(&decrypted);
    }
    Ok(msg)
}
