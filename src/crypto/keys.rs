//! Ed25519 key management.
//!
//! A node owns one long-lived signing keypair. Its address, the only
//! identity inside the ledger, is the first 20 bytes of SHA-256 over the
//! DER (SPKI) encoding of the public key, rendered as lowercase hex on the
//! wire. Public keys travel as SPKI PEM, signatures as base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signer as _, Verifier as _};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};

use super::{sha256, Digest};

/// Length of an address in bytes (160-bit hash prefix).
pub const ADDRESS_BYTES: usize = 20;

/// The sentinel "from" value permitted only on minting transactions.
pub const COINBASE: &str = "coinbase";

/// A 20-byte hash-derived account identifier. Lowercase hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_BYTES]);

impl Address {
    /// Derive the address of a public key: first 20 bytes of
    /// SHA-256 over its DER (SPKI) encoding.
    pub fn of(public_key: &PublicKey) -> Self {
        let digest = sha256(&public_key.to_der());
        let mut out = [0u8; ADDRESS_BYTES];
        out.copy_from_slice(&digest.0[..ADDRESS_BYTES]);
        Address(out)
    }

    /// Parse a 40-character lowercase hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; ADDRESS_BYTES] = bytes.try_into().ok()?;
        Some(Address(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        Address::from_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 40 hex characters"))
    }
}

/// An Ed25519 verifying key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// Verify a detached signature. Returns `false` on any failure rather
    /// than erroring: a malformed signature is just an invalid one.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify(message, &signature.0).is_ok()
    }

    /// SPKI DER encoding (input to address derivation).
    pub fn to_der(&self) -> Vec<u8> {
        match self.0.to_public_key_der() {
            Ok(doc) => doc.as_bytes().to_vec(),
            Err(e) => {
                // Encoding a valid Ed25519 key cannot fail; keep the
                // address derivation total anyway.
                tracing::error!(error = %e, "public key DER encoding failed");
                Vec::new()
            }
        }
    }

    /// SPKI PEM encoding (wire form of public keys).
    pub fn to_pem(&self) -> String {
        self.0
            .to_public_key_pem(LineEnding::LF)
            .unwrap_or_default()
    }

    /// Parse an SPKI PEM public key. `None` on any parse failure.
    pub fn from_pem(pem: &str) -> Option<Self> {
        ed25519_dalek::VerifyingKey::from_public_key_pem(pem)
            .ok()
            .map(PublicKey)
    }

    pub fn address(&self) -> Address {
        Address::of(self)
    }
}

/// A detached Ed25519 signature. Base64 on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// All-zero placeholder, overwritten when a block is sealed. Never
    /// verifies.
    pub fn zeroed() -> Self {
        Signature(ed25519_dalek::Signature::from_bytes(&[0u8; 64]))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }

    /// Decode a base64 signature. `None` on bad base64 or wrong length.
    pub fn from_base64(s: &str) -> Option<Self> {
        let bytes = BASE64.decode(s).ok()?;
        ed25519_dalek::Signature::from_slice(&bytes)
            .ok()
            .map(Signature)
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        Signature::from_base64(&s)
            .ok_or_else(|| serde::de::Error::custom("expected base64 Ed25519 signature"))
    }
}

/// An Ed25519 signing keypair.
///
/// Cloneable because the proposal and receipt subsystems both sign with it.
#[derive(Clone)]
pub struct SigningKeypair {
    signing: ed25519_dalek::SigningKey,
}

impl SigningKeypair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let mut seed = zeroize::Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut *seed);
        SigningKeypair {
            signing: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    pub fn address(&self) -> Address {
        self.public().address()
    }

    /// Sign a message, producing a detached signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message))
    }

    /// Sign a digest (block hashes and votes sign the raw 32 bytes).
    pub fn sign_digest(&self, digest: &Digest) -> Signature {
        self.sign(digest.as_bytes())
    }

    /// PKCS#8 PEM encoding of the secret key (on-disk form).
    pub fn secret_pem(&self) -> zeroize::Zeroizing<String> {
        self.signing
            .to_pkcs8_pem(LineEnding::LF)
            .unwrap_or_else(|_| zeroize::Zeroizing::new(String::new()))
    }

    /// Parse a PKCS#8 PEM secret key. `None` on any parse failure.
    pub fn from_secret_pem(pem: &str) -> Option<Self> {
        ed25519_dalek::SigningKey::from_pkcs8_pem(pem)
            .ok()
            .map(|signing| SigningKeypair { signing })
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKeypair({})", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"hello");
        assert!(kp.public().verify(b"hello", &sig));
        assert!(!kp.public().verify(b"tampered", &sig));
    }

    #[test]
    fn verify_rejects_foreign_signature() {
        let kp = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let sig = other.sign(b"msg");
        assert!(!kp.public().verify(b"msg", &sig));
    }

    #[test]
    fn address_is_20_bytes_of_der_hash() {
        let kp = SigningKeypair::generate();
        let der = kp.public().to_der();
        let digest = sha256(&der);
        assert_eq!(kp.address().0[..], digest.0[..ADDRESS_BYTES]);
        assert_eq!(kp.address().to_hex().len(), 40);
    }

    #[test]
    fn address_hex_roundtrip() {
        let addr = SigningKeypair::generate().address();
        assert_eq!(Address::from_hex(&addr.to_hex()), Some(addr));
    }

    #[test]
    fn public_key_pem_roundtrip() {
        let kp = SigningKeypair::generate();
        let pem = kp.public().to_pem();
        let parsed = PublicKey::from_pem(&pem).unwrap();
        assert_eq!(parsed.address(), kp.address());
    }

    #[test]
    fn secret_pem_roundtrip() {
        let kp = SigningKeypair::generate();
        let pem = kp.secret_pem();
        let restored = SigningKeypair::from_secret_pem(&pem).unwrap();
        assert_eq!(restored.address(), kp.address());
        let sig = restored.sign(b"same key");
        assert!(kp.public().verify(b"same key", &sig));
    }

    #[test]
    fn signature_base64_roundtrip() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"payload");
        let b64 = sig.to_base64();
        let parsed = Signature::from_base64(&b64).unwrap();
        assert!(kp.public().verify(b"payload", &parsed));
    }

    #[test]
    fn malformed_inputs_return_none() {
        assert!(PublicKey::from_pem("not a pem").is_none());
        assert!(Signature::from_base64("!!!").is_none());
        assert!(Signature::from_base64("aGVsbG8=").is_none()); // wrong length
        assert!(Address::from_hex("abc").is_none());
    }
}
