//! C1 — crypto primitives: hashes, AEAD/stream ciphers, RSA sign/verify,
//! password-based key derivation, CSPRNG.
//!
//! The system hash `H` (spec §3) is BLAKE3: digest computation sits on the
//! fountain decode hot path (§4.2 "codec throughput must dominate
//! cryptographic hashing"), and BLAKE3 is the fastest system hash available
//! in the ecosystem stack used elsewhere in this crate. SHA-256/SHA-3 are
//! kept available for call sites that need a specific NIST/Keccak primitive
//! (RSA-PSS padding uses SHA-256 internally via the `rsa` crate).

use aes::Aes256;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce as GcmNonce};
use argon2::Argon2;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

use crate::ident::Identifier;

pub const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    KeyGen(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("signing failed: {0}")]
    SignFailed(String),
    #[error("AEAD operation failed")]
    Aead,
    #[error("invalid key or nonce length")]
    BadLength,
    #[error("key derivation failed: {0}")]
    Kdf(String),
}

// ─── System hash ──────────────────────────────────────────────────────────────

/// `H(bytes)` — the system hash used for block digests, node/user ids, and
/// subkey/IV derivation (spec §3).
pub fn system_hash(bytes: &[u8]) -> Identifier {
    let digest = blake3::hash(bytes);
    Identifier::from_bytes(*digest.as_bytes())
}

/// `H(a ∥ b)` without an intermediate allocation for the concatenation.
pub fn system_hash2(a: &[u8], b: &[u8]) -> Identifier {
    let mut hasher = blake3::Hasher::new();
    hasher.update(a);
    hasher.update(b);
    Identifier::from_bytes(*hasher.finalize().as_bytes())
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn sha3_256(bytes: &[u8]) -> [u8; 32] {
    use sha3::Digest;
    let mut hasher = sha3::Sha3_256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

// ─── RSA identity keys ────────────────────────────────────────────────────────

/// A node or user's long-lived identity keypair. The fingerprint
/// (`H(der-encoded public key)`) is the node/user [`Identifier`] (spec §1, §3).
pub struct KeyPair {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl KeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyGen(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(KeyPair { private, public })
    }

    /// DER-encoded public key bytes — the canonical form hashed to produce
    /// a node/user fingerprint, and the form transmitted in handshakes.
    pub fn public_der(&self) -> Result<Vec<u8>, CryptoError> {
        use rsa::pkcs8::EncodePublicKey;
        self.public
            .to_public_key_der()
            .map(|d| d.as_bytes().to_vec())
            .map_err(|e| CryptoError::KeyGen(e.to_string()))
    }

    /// The fingerprint identifying this keypair, used as node/user id.
    pub fn fingerprint(&self) -> Result<Identifier, CryptoError> {
        Ok(system_hash(&self.public_der()?))
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        sign_with(&self.private, message)
    }
}

pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    use rsa::pkcs8::DecodePublicKey;
    RsaPublicKey::from_public_key_der(der).map_err(|e| CryptoError::KeyGen(e.to_string()))
}

pub fn fingerprint_of_der(der: &[u8]) -> Identifier {
    system_hash(der)
}

pub fn sign_with(private: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let signing_key = SigningKey::<Sha256>::new(private.clone());
    let signature = signing_key.try_sign_with_rng(&mut OsRng, message)
        .map_err(|e| CryptoError::SignFailed(e.to_string()))?;
    Ok(signature.to_vec())
}

pub fn verify_with(public: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
    let sig = rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| CryptoError::BadSignature)?;
    verifying_key
        .verify(message, &sig)
        .map_err(|_| CryptoError::BadSignature)
}

// ─── AES-CTR: per-block resource encryption (spec §3 "Encryption is per-block") ─

/// Encrypt or decrypt (symmetric) `data` in place with AES-256-CTR using
/// `subkey` and `iv`, exactly as derived in `resource::block_subkey`/`block_iv`.
pub fn aes_ctr_apply(subkey: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    type Aes256Ctr = ctr::Ctr128BE<Aes256>;
    let mut cipher = Aes256Ctr::new(subkey.into(), iv.into());
    cipher.apply_keystream(data);
    Ok(())
}

// ─── AES-GCM / ChaCha20-Poly1305: AEAD for the tunnel record layer (§4.5) ──────

pub fn aes_gcm_seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .encrypt(GcmNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Aead)
}

pub fn aes_gcm_open(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(GcmNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Aead)
}

// ─── Password-based key derivation ────────────────────────────────────────────

/// Argon2id derivation used by the resource layer to turn a file digest plus
/// a type/name label into a per-resource salt (spec §4.3 `process`).
pub fn argon2_derive(input: &[u8], label: &[u8], out_len: usize) -> Result<Vec<u8>, CryptoError> {
    let argon2 = Argon2::default();
    let mut out = vec![0u8; out_len];
    argon2
        .hash_password_into(input, label, &mut out)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(out)
}

/// PBKDF2-HMAC-SHA256, kept available per spec C1 alongside Argon2 for call
/// sites that derive a key directly from a low-entropy user passphrase
/// (e.g. importing an identity backup) where Argon2's memory cost is
/// unnecessary overhead.
pub fn pbkdf2_derive(password: &[u8], salt: &[u8], rounds: u32, out_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_len];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password, salt, rounds, &mut out);
    out
}

// ─── CSPRNG ───────────────────────────────────────────────────────────────────

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_hash_is_deterministic() {
        assert_eq!(system_hash(b"hello"), system_hash(b"hello"));
        assert_ne!(system_hash(b"hello"), system_hash(b"world"));
    }

    #[test]
    fn system_hash2_matches_concatenation() {
        let concat = [b"ab".as_slice(), b"cd".as_slice()].concat();
        assert_eq!(system_hash2(b"ab", b"cd"), system_hash(&concat));
    }

    #[test]
    fn rsa_sign_verify_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let sig = kp.sign(b"a message").unwrap();
        verify_with(&kp.public, b"a message", &sig).unwrap();
        assert!(verify_with(&kp.public, b"different", &sig).is_err());
    }

    #[test]
    fn fingerprint_is_hash_of_der_public_key() {
        let kp = KeyPair::generate().unwrap();
        let der = kp.public_der().unwrap();
        assert_eq!(kp.fingerprint().unwrap(), system_hash(&der));
    }

    #[test]
    fn aes_ctr_roundtrip() {
        let key = [7u8; 32];
        let iv = [3u8; 16];
        let mut data = b"the quick brown fox".to_vec();
        let original = data.clone();
        aes_ctr_apply(&key, &iv, &mut data).unwrap();
        assert_ne!(data, original);
        aes_ctr_apply(&key, &iv, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn aes_gcm_roundtrip() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let ct = aes_gcm_seal(&key, &nonce, b"payload").unwrap();
        let pt = aes_gcm_open(&key, &nonce, &ct).unwrap();
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn aes_gcm_rejects_tampering() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let mut ct = aes_gcm_seal(&key, &nonce, b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(aes_gcm_open(&key, &nonce, &ct).is_err());
    }

    #[test]
    fn argon2_is_deterministic_for_same_inputs() {
        let a = argon2_derive(b"filehash", b"file:name", 32).unwrap();
        let b = argon2_derive(b"filehash", b"file:name", 32).unwrap();
        assert_eq!(a, b);
        let c = argon2_derive(b"filehash", b"other:name", 32).unwrap();
        assert_ne!(a, c);
    }
}
