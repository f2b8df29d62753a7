//! Transport backends (spec §4.4 "Backends"): stream and datagram transport
//! providers, abstracted behind a common [`Link`] trait so the routing core
//! in `overlay/mod.rs` never depends on concrete socket types. Production
//! backends perform an authenticated handshake and derive the remote node
//! id from the peer's certificate fingerprint; test code substitutes an
//! in-memory duplex pair implementing the same trait (spec's ambient test
//! tooling, no real sockets in unit tests).

use async_trait::async_trait;
use thiserror::Error;

use crate::ident::Identifier;
use crate::overlay::message::{MessageError, OverlayMessage};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] MessageError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// One authenticated connection to a single remote node, over either a
/// stream or a datagram backend. MTU is not enforced here for the stream
/// backend; the datagram backend pins it to 1452 bytes (spec §4.4).
#[async_trait]
pub trait Link: Send + Sync {
    fn remote_node(&self) -> Identifier;

    async fn send(&self, message: &OverlayMessage) -> Result<(), BackendError>;

    /// Blocks until the next frame arrives or the link closes.
    async fn recv(&self) -> Result<OverlayMessage, BackendError>;
}

/// MTU pinned for the datagram (UDP/DTLS) backend (spec §4.4).
pub const DATAGRAM_MTU: usize = 1452;

/// Stream (TCP) backend (spec §4.4 "Backends"): one [`Link`] per accepted
/// or dialed connection, authenticated the same way `tunneler` authenticates
/// user tunnels — an ephemeral X25519 exchange signed by each side's
/// long-lived RSA identity keypair, HKDF-derived AES-256-GCM record keys —
/// except here the authenticated identity is the *node*, not a user, and
/// the channel is a reliable byte stream rather than a lossy datagram, so
/// records carry an implicit (unsent) counter-derived nonce instead of an
/// explicit sequence number.
pub mod stream {
    use std::time::Duration;

    use rand::RngCore;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use serde::{Deserialize, Serialize};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tokio::sync::Mutex as AsyncMutex;
    use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

    use super::*;
    use crate::crypto;

    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    /// Generous over any single `OverlayMessage` (itself capped by its own
    /// 16-bit content length field): guards against a malicious peer
    /// claiming an unbounded frame length and exhausting memory.
    const MAX_FRAME_LEN: u32 = 1 << 20;

    #[derive(Clone, Serialize, Deserialize)]
    enum HandshakeMessage {
        Hello { ephemeral_pub: [u8; 32], node_der: Vec<u8>, nonce: [u8; 16] },
        Finished { signature: Vec<u8> },
    }

    /// One authenticated TCP connection to a single remote node.
    pub struct StreamLink {
        remote: Identifier,
        send_key: [u8; 32],
        recv_key: [u8; 32],
        send_counter: AsyncMutex<u64>,
        recv_counter: AsyncMutex<u64>,
        reader: AsyncMutex<OwnedReadHalf>,
        writer: AsyncMutex<OwnedWriteHalf>,
    }

    impl StreamLink {
        /// Dial `addr` and perform the client (initiator) side of the
        /// handshake.
        pub async fn connect(
            addr: &str,
            local_private: &RsaPrivateKey,
            local_public: &RsaPublicKey,
        ) -> Result<Self, BackendError> {
            let socket = TcpStream::connect(addr).await?;
            socket.set_nodelay(true).ok();
            let (mut reader, mut writer) = socket.into_split();
            let (remote, send_key, recv_key) =
                tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_initiator(&mut reader, &mut writer, local_private, local_public))
                    .await
                    .map_err(|_| BackendError::Handshake("timed out".into()))??;
            Ok(StreamLink {
                remote,
                send_key,
                recv_key,
                send_counter: AsyncMutex::new(0),
                recv_counter: AsyncMutex::new(0),
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
            })
        }

        /// Perform the server (responder) side of the handshake over an
        /// already-accepted socket.
        pub async fn accept(
            socket: TcpStream,
            local_private: &RsaPrivateKey,
            local_public: &RsaPublicKey,
        ) -> Result<Self, BackendError> {
            socket.set_nodelay(true).ok();
            let (mut reader, mut writer) = socket.into_split();
            let (remote, send_key, recv_key) =
                tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_responder(&mut reader, &mut writer, local_private, local_public))
                    .await
                    .map_err(|_| BackendError::Handshake("timed out".into()))??;
            Ok(StreamLink {
                remote,
                send_key,
                recv_key,
                send_counter: AsyncMutex::new(0),
                recv_counter: AsyncMutex::new(0),
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
            })
        }
    }

    #[async_trait]
    impl Link for StreamLink {
        fn remote_node(&self) -> Identifier {
            self.remote
        }

        async fn send(&self, message: &OverlayMessage) -> Result<(), BackendError> {
            let mut counter = self.send_counter.lock().await;
            let nonce = nonce_for(*counter);
            *counter += 1;
            let ciphertext = crypto::aes_gcm_seal(&self.send_key, &nonce, &message.encode())
                .map_err(|e| BackendError::Transport(e.to_string()))?;
            let mut writer = self.writer.lock().await;
            write_frame(&mut writer, &ciphertext).await
        }

        async fn recv(&self) -> Result<OverlayMessage, BackendError> {
            let ciphertext = {
                let mut reader = self.reader.lock().await;
                read_frame(&mut reader).await?
            };
            let mut counter = self.recv_counter.lock().await;
            let nonce = nonce_for(*counter);
            *counter += 1;
            let plaintext = crypto::aes_gcm_open(&self.recv_key, &nonce, &ciphertext)
                .map_err(|_| BackendError::Handshake("record decrypt failed".into()))?;
            Ok(OverlayMessage::decode(&plaintext)?)
        }
    }

    fn nonce_for(seq: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    /// Same HKDF-SHA256 directional derivation `tunneler` uses, with a
    /// distinct info string so node-link keys and user-tunnel keys never
    /// collide even if (implausibly) the same ephemeral exchange leaked.
    fn derive_keys(shared_secret: &[u8; 32], transcript_hash: &Identifier, initiator: bool) -> ([u8; 32], [u8; 32]) {
        let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(transcript_hash.as_bytes()), shared_secret);
        let mut a_to_b = [0u8; 32];
        let mut b_to_a = [0u8; 32];
        hk.expand(b"teapotnet-node-link initiator-to-responder", &mut a_to_b)
            .expect("32 bytes is a valid HKDF output length");
        hk.expand(b"teapotnet-node-link responder-to-initiator", &mut b_to_a)
            .expect("32 bytes is a valid HKDF output length");
        if initiator {
            (a_to_b, b_to_a)
        } else {
            (b_to_a, a_to_b)
        }
    }

    async fn handshake_initiator(
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        local_private: &RsaPrivateKey,
        local_public: &RsaPublicKey,
    ) -> Result<(Identifier, [u8; 32], [u8; 32]), BackendError> {
        let ephemeral = X25519Secret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_pub = X25519Public::from(&ephemeral);
        let mut client_nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut client_nonce);
        let local_der = crypto::KeyPair { private: local_private.clone(), public: local_public.clone() }
            .public_der()
            .map_err(|e| BackendError::Handshake(e.to_string()))?;

        let hello = HandshakeMessage::Hello { ephemeral_pub: ephemeral_pub.to_bytes(), node_der: local_der, nonce: client_nonce };
        write_frame(writer, &encode_handshake(&hello)).await?;

        let HandshakeMessage::Hello { ephemeral_pub: server_ephemeral, node_der: server_der, nonce: server_nonce } =
            decode_handshake(&read_frame(reader).await?)?
        else {
            return Err(BackendError::Handshake("expected server Hello".into()));
        };

        let shared = ephemeral.diffie_hellman(&X25519Public::from(server_ephemeral));
        let transcript = crypto::system_hash2(&client_nonce, &server_nonce);
        let (send_key, recv_key) = derive_keys(shared.as_bytes(), &transcript, true);

        let finished_payload = [client_nonce.as_slice(), server_nonce.as_slice(), &server_ephemeral].concat();
        let signature = crypto::sign_with(local_private, &finished_payload).map_err(|e| BackendError::Handshake(e.to_string()))?;
        write_frame(writer, &encode_handshake(&HandshakeMessage::Finished { signature })).await?;

        let HandshakeMessage::Finished { signature: server_signature } = decode_handshake(&read_frame(reader).await?)? else {
            return Err(BackendError::Handshake("expected server Finished".into()));
        };
        let server_public = crypto::public_key_from_der(&server_der).map_err(|e| BackendError::Handshake(e.to_string()))?;
        let server_finished_payload = [server_nonce.as_slice(), client_nonce.as_slice(), ephemeral_pub.as_bytes().as_slice()].concat();
        crypto::verify_with(&server_public, &server_finished_payload, &server_signature)
            .map_err(|_| BackendError::Handshake("peer signature verification failed".into()))?;

        Ok((crypto::fingerprint_of_der(&server_der), send_key, recv_key))
    }

    async fn handshake_responder(
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        local_private: &RsaPrivateKey,
        local_public: &RsaPublicKey,
    ) -> Result<(Identifier, [u8; 32], [u8; 32]), BackendError> {
        let HandshakeMessage::Hello { ephemeral_pub: client_ephemeral, node_der: client_der, nonce: client_nonce } =
            decode_handshake(&read_frame(reader).await?)?
        else {
            return Err(BackendError::Handshake("expected client Hello".into()));
        };

        let ephemeral = X25519Secret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_pub = X25519Public::from(&ephemeral);
        let mut server_nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut server_nonce);
        let local_der = crypto::KeyPair { private: local_private.clone(), public: local_public.clone() }
            .public_der()
            .map_err(|e| BackendError::Handshake(e.to_string()))?;

        let hello = HandshakeMessage::Hello { ephemeral_pub: ephemeral_pub.to_bytes(), node_der: local_der, nonce: server_nonce };
        write_frame(writer, &encode_handshake(&hello)).await?;

        let shared = ephemeral.diffie_hellman(&X25519Public::from(client_ephemeral));
        let transcript = crypto::system_hash2(&client_nonce, &server_nonce);
        let (send_key, recv_key) = derive_keys(shared.as_bytes(), &transcript, false);

        let finished_payload = [server_nonce.as_slice(), client_nonce.as_slice(), ephemeral_pub.as_bytes().as_slice()].concat();
        let signature = crypto::sign_with(local_private, &finished_payload).map_err(|e| BackendError::Handshake(e.to_string()))?;
        write_frame(writer, &encode_handshake(&HandshakeMessage::Finished { signature })).await?;

        let HandshakeMessage::Finished { signature: client_signature } = decode_handshake(&read_frame(reader).await?)? else {
            return Err(BackendError::Handshake("expected client Finished".into()));
        };
        let client_public = crypto::public_key_from_der(&client_der).map_err(|e| BackendError::Handshake(e.to_string()))?;
        let client_finished_payload = [client_nonce.as_slice(), server_nonce.as_slice(), &client_ephemeral].concat();
        crypto::verify_with(&client_public, &client_finished_payload, &client_signature)
            .map_err(|_| BackendError::Handshake("peer signature verification failed".into()))?;

        Ok((crypto::fingerprint_of_der(&client_der), send_key, recv_key))
    }

    fn encode_handshake(msg: &HandshakeMessage) -> Vec<u8> {
        bincode::serialize(msg).expect("handshake messages are always serializable")
    }

    fn decode_handshake(bytes: &[u8]) -> Result<HandshakeMessage, BackendError> {
        bincode::deserialize(bytes).map_err(|e| BackendError::Handshake(e.to_string()))
    }

    async fn write_frame(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), BackendError> {
        if bytes.len() as u32 > MAX_FRAME_LEN {
            return Err(BackendError::Transport("frame too large to send".into()));
        }
        writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        writer.write_all(bytes).await?;
        Ok(())
    }

    async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, BackendError> {
        let mut len_bytes = [0u8; 4];
        read_exact_or_closed(reader, &mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_LEN {
            return Err(BackendError::Transport(format!("peer frame of {len} bytes exceeds max")));
        }
        let mut buf = vec![0u8; len as usize];
        read_exact_or_closed(reader, &mut buf).await?;
        Ok(buf)
    }

    async fn read_exact_or_closed(reader: &mut OwnedReadHalf, buf: &mut [u8]) -> Result<(), BackendError> {
        match reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(BackendError::Closed),
            Err(e) => Err(BackendError::Io(e)),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tokio::net::TcpListener;

        #[tokio::test]
        async fn handshake_then_message_roundtrips_over_real_socket() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server_kp = crypto::KeyPair::generate().unwrap();
            let client_kp = crypto::KeyPair::generate().unwrap();
            let server_id = server_kp.fingerprint().unwrap();
            let client_id = client_kp.fingerprint().unwrap();

            let server_private = server_kp.private.clone();
            let server_public = server_kp.public.clone();
            let server_task = tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                StreamLink::accept(socket, &server_private, &server_public).await.unwrap()
            });

            let client_private = client_kp.private.clone();
            let client_public = client_kp.public.clone();
            let addr_string = addr.to_string();
            let client_task =
                tokio::spawn(async move { StreamLink::connect(&addr_string, &client_private, &client_public).await.unwrap() });

            let server_link = server_task.await.unwrap();
            let client_link = client_task.await.unwrap();
            assert_eq!(server_link.remote_node(), client_id);
            assert_eq!(client_link.remote_node(), server_id);

            let msg = OverlayMessage::new(crate::overlay::message::MessageType::Ping, client_id, server_id, b"over tcp".to_vec());
            client_link.send(&msg).await.unwrap();
            let received = server_link.recv().await.unwrap();
            assert_eq!(received.content, b"over tcp");
        }
    }
}

/// In-memory duplex [`Link`] used by tests to exercise routing, DHT and
/// pub/sub logic without opening real sockets.
pub mod duplex {
    use super::*;
    use tokio::sync::mpsc;

    pub struct DuplexLink {
        remote: Identifier,
        tx: mpsc::UnboundedSender<OverlayMessage>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OverlayMessage>>,
    }

    /// Build a connected pair of in-memory links, as if `local_id` and
    /// `remote_id` had just completed a handshake with each other.
    pub fn pair(local_id: Identifier, remote_id: Identifier) -> (DuplexLink, DuplexLink) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        let a = DuplexLink { remote: remote_id, tx: tx_a, rx: tokio::sync::Mutex::new(rx_a) };
        let b = DuplexLink { remote: local_id, tx: tx_b, rx: tokio::sync::Mutex::new(rx_b) };
        (a, b)
    }

    #[async_trait]
    impl Link for DuplexLink {
        fn remote_node(&self) -> Identifier {
            self.remote
        }

        async fn send(&self, message: &OverlayMessage) -> Result<(), BackendError> {
            self.tx.send(message.clone()).map_err(|_| BackendError::Closed)
        }

        async fn recv(&self) -> Result<OverlayMessage, BackendError> {
            self.rx.lock().await.recv().await.ok_or(BackendError::Closed)
        }
    }
}
