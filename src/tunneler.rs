//! C6 — tunneler (spec §4.5): authenticated end-to-end streams between
//! *user* identities (not node identities), carried as overlay `Tunnel`
//! messages.
//!
//! The retrieval pack carries no DTLS/WebRTC crate (spec's own non-goals
//! exclude "the particular choice of cryptographic library" from scope), so
//! the secure channel here is a from-scratch construction built only from
//! crates already used elsewhere in this crate: an ephemeral X25519
//! exchange authenticated by each side's long-lived user RSA keypair,
//! HKDF-SHA256 key derivation, and AES-256-GCM record encryption. It plays
//! the same role DTLS plays in the original design — mutual
//! authentication plus a confidential, integrity-protected datagram
//! channel — without requiring a dependency this pack does not provide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hkdf::Hkdf;
use rand::RngCore;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::crypto::{self, CryptoError};
use crate::ident::Identifier;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake message malformed: {0}")]
    BadHandshake(String),
    #[error("peer signature verification failed")]
    BadSignature,
    #[error("tunnel {0:?} unknown")]
    UnknownTunnel(TunnelId),
    #[error("tunnel closed")]
    Closed,
    #[error("record decrypt failed")]
    RecordAead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelId(pub u64);

impl TunnelId {
    pub fn random() -> Self {
        TunnelId(crypto::random_u64())
    }
}

#[derive(Clone, Serialize, Deserialize)]
enum HandshakeMessage {
    Hello { ephemeral_pub: [u8; 32], user_der: Vec<u8>, nonce: [u8; 16] },
    Finished { signature: Vec<u8> },
}

/// A half-open or established tunnel: per-direction AEAD keys and counters
/// derived from the X25519 exchange, plus the authenticated remote user id.
pub struct Tunnel {
    pub id: TunnelId,
    pub remote_user: Identifier,
    send_key: [u8; 32],
    recv_key: [u8; 32],
    send_counter: Mutex<u64>,
    recv_seen: Mutex<std::collections::HashSet<u64>>,
}

impl Tunnel {
    /// Seal one record for transmission (spec §4.5 "datagrams for a tunnel
    /// are framed as Overlay.Tunnel(content = id_64 ∥ dtls_record)" — this
    /// produces the `dtls_record` portion).
    pub async fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let mut counter = self.send_counter.lock().await;
        let seq = *counter;
        *counter += 1;
        let nonce = nonce_for(seq);
        let ciphertext = crypto::aes_gcm_seal(&self.send_key, &nonce, plaintext).map_err(TunnelError::Crypto)?;
        let mut out = seq.to_be_bytes().to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a received record, rejecting already-seen sequence numbers
    /// (replay protection analogous to DTLS's anti-replay window).
    pub async fn open(&self, record: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if record.len() < 8 {
            return Err(TunnelError::RecordAead);
        }
        let seq = u64::from_be_bytes(record[..8].try_into().unwrap());
        {
            let mut seen = self.recv_seen.lock().await;
            if !seen.insert(seq) {
                return Err(TunnelError::RecordAead);
            }
        }
        let nonce = nonce_for(seq);
        crypto::aes_gcm_open(&self.recv_key, &nonce, &record[8..]).map_err(|_| TunnelError::RecordAead)
    }
}

fn nonce_for(seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

/// Derive the pair of directional AEAD keys from a completed X25519
/// exchange, using the handshake transcript hash as HKDF salt so each
/// handshake yields independent keys even if ephemeral keys were reused.
fn derive_keys(shared_secret: &[u8; 32], transcript_hash: &Identifier, initiator: bool) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(transcript_hash.as_bytes()), shared_secret);
    let mut a_to_b = [0u8; 32];
    let mut b_to_a = [0u8; 32];
    hk.expand(b"teapotnet-tunnel initiator-to-responder", &mut a_to_b)
        .expect("32 bytes is a valid HKDF output length");
    hk.expand(b"teapotnet-tunnel responder-to-initiator", &mut b_to_a)
        .expect("32 bytes is a valid HKDF output length");
    if initiator {
        (a_to_b, b_to_a)
    } else {
        (b_to_a, a_to_b)
    }
}

/// Drive one side of the handshake over a pair of async byte-oriented
/// send/recv closures. `send`/`recv` operate on whole handshake datagrams
/// (the overlay `Tunnel` message already demultiplexes by tunnel id).
pub async fn handshake_initiator(
    local_private: &RsaPrivateKey,
    local_public: &RsaPublicKey,
    send: &mpsc::UnboundedSender<Vec<u8>>,
    recv: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(Identifier, [u8; 32], [u8; 32]), TunnelError> {
    let ephemeral = X25519Secret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let mut client_nonce = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut client_nonce);
    let local_der = crypto::KeyPair { private: local_private.clone(), public: local_public.clone() }.public_der()?;

    let hello = HandshakeMessage::Hello { ephemeral_pub: ephemeral_pub.to_bytes(), user_der: local_der.clone(), nonce: client_nonce };
    send.send(encode_handshake(&hello)).map_err(|_| TunnelError::Closed)?;

    let server_hello = decode_handshake(&recv.recv().await.ok_or(TunnelError::Closed)?)?;
    let HandshakeMessage::Hello { ephemeral_pub: server_ephemeral, user_der: server_der, nonce: server_nonce } = server_hello else {
        return Err(TunnelError::BadHandshake("expected server Hello".into()));
    };

    let shared = ephemeral.diffie_hellman(&X25519Public::from(server_ephemeral));
    let transcript = crypto::system_hash2(&client_nonce, &server_nonce);
    let (send_key, recv_key) = derive_keys(shared.as_bytes(), &transcript, true);

    let finished_payload = [client_nonce.as_slice(), server_nonce.as_slice(), &server_ephemeral].concat();
    let signature = crypto::sign_with(local_private, &finished_payload)?;
    send.send(encode_handshake(&HandshakeMessage::Finished { signature })).map_err(|_| TunnelError::Closed)?;

    let server_finished = decode_handshake(&recv.recv().await.ok_or(TunnelError::Closed)?)?;
    let HandshakeMessage::Finished { signature: server_signature } = server_finished else {
        return Err(TunnelError::BadHandshake("expected server Finished".into()));
    };
    let server_public = crypto::public_key_from_der(&server_der)?;
    let server_finished_payload = [server_nonce.as_slice(), client_nonce.as_slice(), ephemeral_pub.as_bytes().as_slice()].concat();
    crypto::verify_with(&server_public, &server_finished_payload, &server_signature).map_err(|_| TunnelError::BadSignature)?;

    let remote_user = crypto::fingerprint_of_der(&server_der);
    Ok((remote_user, send_key, recv_key))
}

pub async fn handshake_responder(
    local_private: &RsaPrivateKey,
    local_public: &RsaPublicKey,
    send: &mpsc::UnboundedSender<Vec<u8>>,
    recv: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(Identifier, [u8; 32], [u8; 32]), TunnelError> {
    let client_hello = decode_handshake(&recv.recv().await.ok_or(TunnelError::Closed)?)?;
    let HandshakeMessage::Hello { ephemeral_pub: client_ephemeral, user_der: client_der, nonce: client_nonce } = client_hello else {
        return Err(TunnelError::BadHandshake("expected client Hello".into()));
    };

    let ephemeral = X25519Secret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let mut server_nonce = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut server_nonce);
    let local_der = crypto::KeyPair { private: local_private.clone(), public: local_public.clone() }.public_der()?;

    let hello = HandshakeMessage::Hello { ephemeral_pub: ephemeral_pub.to_bytes(), user_der: local_der, nonce: server_nonce };
    send.send(encode_handshake(&hello)).map_err(|_| TunnelError::Closed)?;

    let shared = ephemeral.diffie_hellman(&X25519Public::from(client_ephemeral));
    let transcript = crypto::system_hash2(&client_nonce, &server_nonce);
    let (send_key, recv_key) = derive_keys(shared.as_bytes(), &transcript, false);

    let finished_payload = [server_nonce.as_slice(), client_nonce.as_slice(), ephemeral_pub.as_bytes().as_slice()].concat();
    let signature = crypto::sign_with(local_private, &finished_payload)?;
    send.send(encode_handshake(&HandshakeMessage::Finished { signature })).map_err(|_| TunnelError::Closed)?;

    let client_finished = decode_handshake(&recv.recv().await.ok_or(TunnelError::Closed)?)?;
    let HandshakeMessage::Finished { signature: client_signature } = client_finished else {
        return Err(TunnelError::BadHandshake("expected client Finished".into()));
    };
    let client_public = crypto::public_key_from_der(&client_der)?;
    let client_finished_payload = [client_nonce.as_slice(), server_nonce.as_slice(), &client_ephemeral].concat();
    crypto::verify_with(&client_public, &client_finished_payload, &client_signature).map_err(|_| TunnelError::BadSignature)?;

    let remote_user = crypto::fingerprint_of_der(&client_der);
    Ok((remote_user, send_key, recv_key))
}

fn encode_handshake(msg: &HandshakeMessage) -> Vec<u8> {
    bincode::serialize(msg).expect("handshake messages are always serializable")
}

fn decode_handshake(bytes: &[u8]) -> Result<HandshakeMessage, TunnelError> {
    bincode::deserialize(bytes).map_err(|e| TunnelError::BadHandshake(e.to_string()))
}

/// Owns all tunnels for this node: pending initiator state keyed by the
/// remote node id, and established tunnels keyed by [`TunnelId`] (spec
/// §4.5 "initiator stores the id under pending[node]; the responder
/// assigns the id on first datagram seen").
pub struct Tunneler {
    local_private: RsaPrivateKey,
    local_public: RsaPublicKey,
    pending: Mutex<HashMap<Identifier, TunnelId>>,
    tunnels: RwLock<HashMap<TunnelId, Arc<Tunnel>>>,
    idle_timeout: Duration,
    retransmit_timeout: Duration,
    keepalive_timeout: Duration,
}

impl Tunneler {
    /// `retransmit_timeout`/`keepalive_timeout` are the values a per-tunnel
    /// [`crate::network::Handler`] spawned over this tunnel's datagrams
    /// should use for its own alarms (spec §4.6), kept alongside
    /// `idle_timeout` so one `config` plumbs through to both layers.
    pub fn new(
        local_private: RsaPrivateKey,
        local_public: RsaPublicKey,
        idle_timeout: Duration,
        retransmit_timeout: Duration,
        keepalive_timeout: Duration,
    ) -> Self {
        Tunneler {
            local_private,
            local_public,
            pending: Mutex::new(HashMap::new()),
            tunnels: RwLock::new(HashMap::new()),
            idle_timeout,
            retransmit_timeout,
            keepalive_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn retransmit_timeout(&self) -> Duration {
        self.retransmit_timeout
    }

    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_timeout
    }

    pub async fn reserve_pending(&self, remote_node: Identifier) -> TunnelId {
        let id = TunnelId::random();
        self.pending.lock().await.insert(remote_node, id);
        id
    }

    pub async fn take_pending(&self, remote_node: &Identifier) -> Option<TunnelId> {
        self.pending.lock().await.remove(remote_node)
    }

    pub async fn insert(&self, tunnel: Arc<Tunnel>) {
        self.tunnels.write().await.insert(tunnel.id, tunnel);
    }

    pub async fn get(&self, id: &TunnelId) -> Option<Arc<Tunnel>> {
        self.tunnels.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &TunnelId) -> Option<Arc<Tunnel>> {
        self.tunnels.write().await.remove(id)
    }

    /// Complete a client-side handshake with an in-process channel pair
    /// (production callers instead drive `send`/`recv` over the overlay's
    /// `Tunnel` message datagrams for this tunnel id).
    pub async fn connect(
        self: &Arc<Self>,
        id: TunnelId,
        send: mpsc::UnboundedSender<Vec<u8>>,
        mut recv: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let (remote_user, send_key, recv_key) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake_initiator(&self.local_private, &self.local_public, &send, &mut recv),
        )
        .await
        .map_err(|_| TunnelError::HandshakeTimeout)??;

        let tunnel = Arc::new(Tunnel {
            id,
            remote_user,
            send_key,
            recv_key,
            send_counter: Mutex::new(0),
            recv_seen: Mutex::new(std::collections::HashSet::new()),
        });
        self.insert(tunnel.clone()).await;
        Ok(tunnel)
    }

    pub async fn accept(
        self: &Arc<Self>,
        id: TunnelId,
        send: mpsc::UnboundedSender<Vec<u8>>,
        mut recv: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let (remote_user, send_key, recv_key) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake_responder(&self.local_private, &self.local_public, &send, &mut recv),
        )
        .await
        .map_err(|_| TunnelError::HandshakeTimeout)??;

        let tunnel = Arc::new(Tunnel {
            id,
            remote_user,
            send_key,
            recv_key,
            send_counter: Mutex::new(0),
            recv_seen: Mutex::new(std::collections::HashSet::new()),
        });
        self.insert(tunnel.clone()).await;
        Ok(tunnel)
    }
}
