//! C4 — resource layer (spec §3 "Resource Index Record", §4.3).
//!
//! A resource is a typed, possibly-encrypted object described by an
//! [`IndexRecord`] and realized as an ordered sequence of content blocks.
//! The index record is itself serialized into a block (the "index block");
//! the resource digest is that block's digest.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto;
use crate::ident::Identifier;
use crate::store::BlockStore;

/// Maximum logical size of one content block (spec §3 "B ≈ 256 KiB").
pub const MAX_BLOCK_SIZE: usize = 256 * 1024;

/// How many upcoming blocks [`Reader`] keeps prefetched (spec §4.3).
pub const PREFETCH_BLOCKS: usize = 10;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("index record not found for digest {0}")]
    NotFound(Identifier),
    #[error("resource is not fully available locally")]
    NotLocallyAvailable,
    #[error("signature verification failed")]
    BadSignature,
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexRecord {
    pub name: String,
    pub r#type: String,
    pub size: u64,
    /// Empty iff the content is unencrypted.
    pub salt: Vec<u8>,
    /// Digests of index records this one supersedes (mutable series).
    pub previous: Vec<Identifier>,
    /// Content blocks, in order.
    pub blocks: Vec<Identifier>,
    pub signature: Vec<u8>,
}

impl IndexRecord {
    pub fn is_encrypted(&self) -> bool {
        !self.salt.is_empty()
    }

    fn encode(&self) -> Result<Vec<u8>, ResourceError> {
        bincode::serialize(self).map_err(|e| ResourceError::Serde(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, ResourceError> {
        bincode::deserialize(bytes).map_err(|e| ResourceError::Serde(e.to_string()))
    }
}

/// A per-child entry inside a directory resource's content stream (spec §3
/// "Directory record").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub name: String,
    pub r#type: String,
    pub size: u64,
    pub digest: Identifier,
    pub time: u64,
}

/// A signed authored record (spec §3 "Mail").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mail {
    pub content: Vec<u8>,
    pub author: String,
    pub author_id: Identifier,
    pub time: u64,
    pub parent_digest: Option<Identifier>,
    pub attachments: Vec<Identifier>,
    pub signature: Vec<u8>,
}

impl Mail {
    /// Bytes that are signed: the record with `signature` cleared.
    fn signable_bytes(&self) -> Result<Vec<u8>, ResourceError> {
        let mut clone = self.clone();
        clone.signature.clear();
        bincode::serialize(&clone).map_err(|e| ResourceError::Serde(e.to_string()))
    }

    pub fn sign(&mut self, private: &rsa::RsaPrivateKey) -> Result<(), ResourceError> {
        let bytes = self.signable_bytes()?;
        self.signature = crypto::sign_with(private, &bytes)?;
        Ok(())
    }

    pub fn verify(&self, public: &rsa::RsaPublicKey) -> Result<(), ResourceError> {
        let bytes = self.signable_bytes()?;
        crypto::verify_with(public, &bytes, &self.signature).map_err(|_| ResourceError::BadSignature)
    }

    /// Digest identifying this mail (spec §3: "signing the serialized
    /// record with the signature field cleared").
    pub fn digest(&self) -> Result<Identifier, ResourceError> {
        Ok(crypto::system_hash(&self.signable_bytes()?))
    }
}

/// Parameters controlling how [`process`] builds a resource.
#[derive(Clone, Debug, Default)]
pub struct ProcessSpecs {
    pub name: String,
    pub r#type: String,
    /// Non-empty enables per-block AES-256-CTR encryption.
    pub secret: Vec<u8>,
    pub previous: Vec<Identifier>,
}

fn block_subkey(master_key: &[u8], index: u64) -> [u8; 32] {
    *crypto::system_hash2(master_key, &index.to_be_bytes()).as_bytes()
}

fn block_iv(salt: &[u8], index: u64) -> [u8; 16] {
    let hash = crypto::system_hash2(salt, &index.to_be_bytes());
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&hash.as_bytes()[..16]);
    iv
}

/// Split `content` into blocks of up to [`MAX_BLOCK_SIZE`], optionally
/// encrypting each with `specs.secret`, and store an [`IndexRecord`]
/// referencing them. Returns the resource digest (spec §4.3 `process`).
pub async fn process(
    store: &Arc<BlockStore>,
    content: &[u8],
    specs: ProcessSpecs,
) -> Result<Identifier, ResourceError> {
    let salt = if specs.secret.is_empty() {
        Vec::new()
    } else {
        let file_hash = crypto::system_hash(content);
        let label = format!("{}:{}", specs.r#type, specs.name);
        crypto::argon2_derive(file_hash.as_bytes(), label.as_bytes(), 16)?
    };

    let mut blocks = Vec::new();
    for (index, chunk) in content.chunks(MAX_BLOCK_SIZE).enumerate() {
        let stored = if specs.secret.is_empty() {
            chunk.to_vec()
        } else {
            let mut buf = chunk.to_vec();
            let subkey = block_subkey(&specs.secret, index as u64);
            let iv = block_iv(&salt, index as u64);
            crypto::aes_ctr_apply(&subkey, &iv, &mut buf)?;
            buf
        };
        let digest = store.put_verified(&stored).await?;
        blocks.push(digest);
    }
    // An empty file still produces a well-formed index with zero blocks
    // (spec §8 "Boundaries").

    let record = IndexRecord {
        name: specs.name,
        r#type: specs.r#type,
        size: content.len() as u64,
        salt,
        previous: specs.previous,
        blocks,
        signature: Vec::new(),
    };
    let encoded = record.encode()?;
    let digest = store.put_verified(&encoded).await?;

    for content_digest in &record.blocks {
        store.add_hint(content_digest, &digest).await?;
    }

    Ok(digest)
}

/// Load the index record for `digest`. If `local_only` is set and the index
/// block itself is not present, returns [`ResourceError::NotFound`] rather
/// than attempting a remote fetch (remote fetch is orchestrated by the
/// caller's caller via the overlay/direct-call layer, §4.9).
pub async fn fetch(
    store: &Arc<BlockStore>,
    digest: &Identifier,
    local_only: bool,
) -> Result<IndexRecord, ResourceError> {
    if local_only && !store.has_block(digest).await? {
        return Err(ResourceError::NotFound(*digest));
    }
    store.wait_block(digest, std::time::Duration::from_secs(if local_only { 0 } else { 30 }), None).await.ok();
    let bytes = store.get_block(digest).await.map_err(|_| ResourceError::NotFound(*digest))?;
    let record = IndexRecord::decode(&bytes)?;

    for content_digest in &record.blocks {
        store.add_hint(content_digest, digest).await?;
    }

    Ok(record)
}

/// `true` iff every block named by `record` is present in `store` (spec §3
/// invariant "A resource is locally available iff...").
pub async fn is_locally_available(store: &Arc<BlockStore>, record: &IndexRecord) -> Result<bool, ResourceError> {
    for digest in &record.blocks {
        if !store.has_block(digest).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Sequential reader over a resource's decoded content bytes, prefetching up
/// to [`PREFETCH_BLOCKS`] upcoming blocks (spec §4.3 `Reader`).
pub struct Reader {
    store: Arc<BlockStore>,
    record: IndexRecord,
    pos: u64,
    prefetch_inflight: std::collections::HashSet<usize>,
}

impl Reader {
    pub fn new(store: Arc<BlockStore>, record: IndexRecord) -> Self {
        Reader { store, record, pos: 0, prefetch_inflight: std::collections::HashSet::new() }
    }

    fn block_index_for(&self, pos: u64) -> (usize, usize) {
        let block_index = (pos / MAX_BLOCK_SIZE as u64) as usize;
        let offset = (pos % MAX_BLOCK_SIZE as u64) as usize;
        (block_index, offset)
    }

    /// Reposition the read cursor; recomputes block index and intra-block
    /// offset from scratch (spec §4.3 "positional seek recomputes...").
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos.min(self.record.size);
    }

    async fn decode_block(&self, block_index: usize) -> Result<Vec<u8>, ResourceError> {
        let digest = *self
            .record
            .blocks
            .get(block_index)
            .ok_or(ResourceError::NotFound(Identifier::ZERO))?;
        self.store
            .wait_block(&digest, std::time::Duration::from_secs(30), None)
            .await
            .ok();
        let mut bytes = self.store.get_block(&digest).await.map_err(|_| ResourceError::NotLocallyAvailable)?;
        if bytes.len() > MAX_BLOCK_SIZE {
            bytes.truncate(MAX_BLOCK_SIZE);
        }
        Ok(bytes)
    }

    /// Decrypt a block already read from the store, given the resource's
    /// `master_key` (the caller's secret — never persisted in the index
    /// record itself, only `salt` is).
    fn decrypt_block(&self, master_key: &[u8], block_index: usize, bytes: &mut [u8]) -> Result<(), ResourceError> {
        if !self.record.is_encrypted() {
            return Ok(());
        }
        let subkey = block_subkey(master_key, block_index as u64);
        let iv = block_iv(&self.record.salt, block_index as u64);
        crypto::aes_ctr_apply(&subkey, &iv, bytes)?;
        Ok(())
    }

    /// Read up to `buf.len()` decoded bytes starting at the current cursor.
    /// `master_key` must be supplied whenever the resource is encrypted.
    pub async fn read(&mut self, buf: &mut [u8], master_key: &[u8]) -> Result<usize, ResourceError> {
        if self.pos >= self.record.size || buf.is_empty() {
            return Ok(0);
        }
        let (block_index, offset) = self.block_index_for(self.pos);
        self.kick_off_prefetch(block_index);

        let mut block = self.decode_block(block_index).await?;
        self.decrypt_block(master_key, block_index, &mut block)?;

        let avail = block.len().saturating_sub(offset);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&block[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn kick_off_prefetch(&mut self, from_block: usize) {
        // Best-effort: mark upcoming blocks as wanted so the direct-call
        // layer (§4.9) can prioritize fetching them; actual scheduling is
        // driven by the caller pumping `wait_block` on the store, so this
        // is purely bookkeeping of which indices are "in flight".
        for i in from_block..(from_block + PREFETCH_BLOCKS).min(self.record.blocks.len()) {
            self.prefetch_inflight.insert(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_file_produces_zero_block_index() {
        let store = Arc::new(BlockStore::open_in_memory_for_tests().await.unwrap());
        let digest = process(&store, &[], ProcessSpecs { name: "empty".into(), r#type: "file".into(), ..Default::default() })
            .await
            .unwrap();
        let record = fetch(&store, &digest, true).await.unwrap();
        assert!(record.blocks.is_empty());
        assert_eq!(record.size, 0);
    }

    #[tokio::test]
    async fn roundtrip_unencrypted_multi_block() {
        let store = Arc::new(BlockStore::open_in_memory_for_tests().await.unwrap());
        let content: Vec<u8> = (0..(MAX_BLOCK_SIZE * 2 + 123)).map(|i| (i % 256) as u8).collect();
        let digest = process(&store, &content, ProcessSpecs { name: "f".into(), r#type: "file".into(), ..Default::default() })
            .await
            .unwrap();
        let record = fetch(&store, &digest, true).await.unwrap();
        assert_eq!(record.blocks.len(), 3);

        let mut reader = Reader::new(store.clone(), record);
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read(&mut buf, &[]).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, content);
    }

    #[tokio::test]
    async fn roundtrip_encrypted_content() {
        let store = Arc::new(BlockStore::open_in_memory_for_tests().await.unwrap());
        let content = b"top secret directory listing payload".repeat(10);
        let secret = b"shared-secret-key".to_vec();
        let digest = process(
            &store,
            &content,
            ProcessSpecs { name: "d".into(), r#type: "directory".into(), secret: secret.clone(), ..Default::default() },
        )
        .await
        .unwrap();
        let record = fetch(&store, &digest, true).await.unwrap();
        assert!(record.is_encrypted());

        let mut reader = Reader::new(store.clone(), record);
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read(&mut buf, &secret).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, content);
    }

    #[test]
    fn directory_record_reserializes_identically() {
        let rec = DirectoryRecord {
            name: "notes.txt".into(),
            r#type: "file".into(),
            size: 42,
            digest: crypto::system_hash(b"x"),
            time: 1_700_000_000,
        };
        let bytes = bincode::serialize(&rec).unwrap();
        let back: DirectoryRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, rec);
        let bytes2 = bincode::serialize(&back).unwrap();
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn mail_signature_roundtrips() {
        let kp = crate::crypto::KeyPair::generate().unwrap();
        let author_id = kp.fingerprint().unwrap();
        let mut mail = Mail {
            content: b"hello board".to_vec(),
            author: "alice".into(),
            author_id,
            time: 1,
            parent_digest: None,
            attachments: vec![],
            signature: vec![],
        };
        mail.sign(&kp.private).unwrap();
        mail.verify(&kp.public).unwrap();

        let mut tampered = mail.clone();
        tampered.content = b"hello board!!".to_vec();
        assert!(tampered.verify(&kp.public).is_err());
    }
}
