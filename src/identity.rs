//! C9 glue — node/user identity lifecycle (spec §1 "long-lived identity",
//! §6 "keys file"). Thin: an identity is just a persisted RSA keypair plus
//! the fingerprint derived from it. One [`Identity`] backs either the node
//! itself or a user hosted on it (GLOSSARY "one user may simultaneously be
//! instantiated on several nodes" — nothing here assumes uniqueness beyond
//! the keypair).

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, CryptoError, KeyPair};
use crate::ident::Identifier;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed identity file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed DER key: {0}")]
    Der(String),
}

/// Subset of spec §6's `keys` file this module owns: `publickey` and
/// `privatekey`, base64 DER. The `peers` map lives in its own sibling file
/// (see [`crate::overlay::peerstore`]) — one file per concern, matching
/// the `store.db` / cache-directory split the block store already uses.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    publickey: String,
    privatekey: String,
}

/// One long-lived RSA identity: a node identity, or a user identity.
pub struct Identity {
    pub keypair: KeyPair,
    pub id: Identifier,
}

impl Identity {
    pub fn generate() -> Result<Self, IdentityError> {
        let keypair = KeyPair::generate()?;
        let id = keypair.fingerprint()?;
        Ok(Identity { keypair, id })
    }

    /// Load the identity at `path`, generating and persisting a fresh one
    /// if the file does not exist yet (first-run lifecycle).
    pub async fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => Self::decode(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate()?;
                identity.save(path).await?;
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, IdentityError> {
        let file: IdentityFile = serde_json::from_slice(bytes)?;
        let public_der = BASE64.decode(&file.publickey)?;
        let private_der = BASE64.decode(&file.privatekey)?;
        let public = rsa::RsaPublicKey::from_public_key_der(&public_der).map_err(|e| IdentityError::Der(e.to_string()))?;
        let private = rsa::RsaPrivateKey::from_pkcs8_der(&private_der).map_err(|e| IdentityError::Der(e.to_string()))?;
        let keypair = KeyPair { private, public };
        let id = keypair.fingerprint()?;
        Ok(Identity { keypair, id })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), IdentityError> {
        let public_der = self.keypair.public_der()?;
        let private_der = self
            .keypair
            .private
            .to_pkcs8_der()
            .map_err(|e| IdentityError::Der(e.to_string()))?;
        let file = IdentityFile {
            publickey: BASE64.encode(public_der),
            privatekey: BASE64.encode(private_der.as_bytes()),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, IdentityError> {
        Ok(self.keypair.sign(message)?)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        crypto::verify_with(&self.keypair.public, message, signature)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_then_save_then_reload_roundtrips_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let identity = Identity::generate().unwrap();
        identity.save(&path).await.unwrap();

        let reloaded = Identity::load_or_generate(&path).await.unwrap();
        assert_eq!(reloaded.id, identity.id);
    }

    #[tokio::test]
    async fn missing_file_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        assert!(!path.exists());
        let identity = Identity::load_or_generate(&path).await.unwrap();
        assert!(path.exists());

        let reloaded = Identity::load_or_generate(&path).await.unwrap();
        assert_eq!(reloaded.id, identity.id);
    }

    #[test]
    fn sign_verify_roundtrips() {
        let identity = Identity::generate().unwrap();
        let sig = identity.sign(b"hello").unwrap();
        identity.verify(b"hello", &sig).unwrap();
        assert!(identity.verify(b"tampered", &sig).is_err());
    }
}
