//! Snapshot container format.
//!
//! ```text
//! magic "SNAPKV01" | version u16 | flags u8
//! plain:     body digest [32] | body
//! encrypted: salt [16] | nonce [12] | ChaCha20-Poly1305(body)
//! body = meta_len u64 | bincode(meta) | zstd(payload) ...
//! ```
//!
//! Payloads are compressed before the body is encrypted. For encrypted
//! containers the header and salt are authenticated as associated data.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Passphrase, NONCE_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use crate::hasher::{self, Fingerprint};
use crate::snapshot::{
    validate_relative_path, Entry, Payload, Snapshot, SnapshotId, SnapshotKind, StorageMode,
};

pub const MAGIC: &[u8; 8] = b"SNAPKV01";
pub const FORMAT_VERSION: u16 = 1;

const FLAG_ENCRYPTED: u8 = 0b0000_0001;
const HEADER_LEN: usize = MAGIC.len() + 2 + 1;
const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u16,
    pub encrypted: bool,
}

#[derive(Serialize, Deserialize)]
struct ContainerMeta {
    id: SnapshotId,
    timestamp: DateTime<Utc>,
    parent: Option<SnapshotId>,
    label: Option<String>,
    description: Option<String>,
    removed: BTreeSet<String>,
    entries: Vec<EntryHeader>,
}

#[derive(Serialize, Deserialize)]
struct EntryHeader {
    path: String,
    size: u64,
    mode: u32,
    fingerprint: Fingerprint,
    storage: StorageMode,
    compressed_len: u64,
}

/// Serialize a snapshot into container bytes, encrypting when a passphrase is given.
pub fn encode(
    snapshot: &Snapshot,
    passphrase: Option<&Passphrase>,
    compression_level: i32,
) -> Result<Vec<u8>> {
    let mut headers = Vec::with_capacity(snapshot.entries.len());
    let mut blobs = Vec::with_capacity(snapshot.entries.len());

    for entry in snapshot.entries.values() {
        let compressed = zstd::bulk::compress(entry.payload.bytes(), compression_level)
            .map_err(|e| Error::Encode {
                reason: format!("failed to compress {}: {e}", entry.path),
            })?;
        headers.push(EntryHeader {
            path: entry.path.clone(),
            size: entry.size,
            mode: entry.mode,
            fingerprint: entry.fingerprint,
            storage: entry.storage_mode(),
            compressed_len: compressed.len() as u64,
        });
        blobs.push(compressed);
    }

    let meta = ContainerMeta {
        id: snapshot.id,
        timestamp: snapshot.timestamp,
        parent: snapshot.kind.parent(),
        label: snapshot.label.clone(),
        description: snapshot.description.clone(),
        removed: snapshot.removed.clone(),
        entries: headers,
    };
    let meta_bytes = bincode::serialize(&meta).map_err(|e| Error::Encode {
        reason: format!("failed to serialize snapshot metadata: {e}"),
    })?;

    let payload_len: usize = blobs.iter().map(Vec::len).sum();
    let mut body = Vec::with_capacity(8 + meta_bytes.len() + payload_len);
    body.extend_from_slice(&(meta_bytes.len() as u64).to_le_bytes());
    body.extend_from_slice(&meta_bytes);
    for blob in &blobs {
        body.extend_from_slice(blob);
    }

    let flags = if passphrase.is_some() { FLAG_ENCRYPTED } else { 0 };
    let mut out = Vec::with_capacity(HEADER_LEN + SALT_SIZE + NONCE_SIZE + body.len() + 16);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(flags);

    match passphrase {
        Some(passphrase) => {
            let salt = crypto::random_salt();
            out.extend_from_slice(&salt);
            let (nonce, ciphertext) = crypto::seal(passphrase, &salt, &out, &body)?;
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
        }
        None => {
            out.extend_from_slice(hasher::fingerprint(&body).as_bytes());
            out.extend_from_slice(&body);
        }
    }

    Ok(out)
}

/// Read the fixed header without needing a key.
pub fn peek_header(data: &[u8]) -> Result<ContainerHeader> {
    if data.len() < HEADER_LEN {
        return Err(Error::decode("container shorter than its header"));
    }
    if &data[..MAGIC.len()] != MAGIC {
        return Err(Error::decode("missing container magic"));
    }
    let version = u16::from_le_bytes([data[MAGIC.len()], data[MAGIC.len() + 1]]);
    if version > FORMAT_VERSION {
        return Err(Error::VersionMismatch {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    if version == 0 {
        return Err(Error::decode("container version 0 is invalid"));
    }
    let flags = data[HEADER_LEN - 1];
    if flags & !FLAG_ENCRYPTED != 0 {
        return Err(Error::decode(format!("unknown container flags {flags:#04x}")));
    }
    Ok(ContainerHeader {
        version,
        encrypted: flags & FLAG_ENCRYPTED != 0,
    })
}

/// Deserialize container bytes back into a snapshot.
pub fn decode(data: &[u8], passphrase: Option<&Passphrase>) -> Result<Snapshot> {
    let header = peek_header(data)?;

    let body = if header.encrypted {
        let passphrase = passphrase.ok_or(Error::MissingKey)?;
        let aad_end = HEADER_LEN + SALT_SIZE;
        let nonce_end = aad_end + NONCE_SIZE;
        if data.len() < nonce_end {
            return Err(Error::decode("encrypted container truncated"));
        }
        crypto::open(
            passphrase,
            &data[HEADER_LEN..aad_end],
            &data[aad_end..nonce_end],
            &data[..aad_end],
            &data[nonce_end..],
        )?
    } else {
        if data.len() < HEADER_LEN + DIGEST_LEN {
            return Err(Error::decode("container truncated before body digest"));
        }
        let body = &data[HEADER_LEN + DIGEST_LEN..];
        let recorded = &data[HEADER_LEN..HEADER_LEN + DIGEST_LEN];
        if hasher::fingerprint(body).as_bytes() != recorded {
            return Err(Error::decode("body digest mismatch"));
        }
        body.to_vec()
    };

    parse_body(&body)
}

fn parse_body(body: &[u8]) -> Result<Snapshot> {
    if body.len() < 8 {
        return Err(Error::decode("body shorter than metadata length"));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&body[..8]);
    let meta_len = u64::from_le_bytes(len_bytes) as usize;
    let meta_end = 8usize
        .checked_add(meta_len)
        .filter(|&end| end <= body.len())
        .ok_or_else(|| Error::decode("metadata length exceeds body"))?;

    let meta: ContainerMeta = bincode::deserialize(&body[8..meta_end])
        .map_err(|e| Error::decode(format!("bad snapshot metadata: {e}")))?;

    let mut entries = BTreeMap::new();
    let mut cursor = meta_end;
    for header in meta.entries {
        validate_relative_path(&header.path)?;
        let end = cursor
            .checked_add(header.compressed_len as usize)
            .filter(|&end| end <= body.len())
            .ok_or_else(|| Error::decode(format!("payload for {} truncated", header.path)))?;
        let bytes = zstd::stream::decode_all(&body[cursor..end])
            .map_err(|e| Error::decode(format!("payload for {} undecodable: {e}", header.path)))?;
        cursor = end;

        let payload = match header.storage {
            StorageMode::Stored => {
                if bytes.len() as u64 != header.size {
                    return Err(Error::decode(format!(
                        "stored payload for {} is {} bytes, expected {}",
                        header.path,
                        bytes.len(),
                        header.size
                    )));
                }
                Payload::Stored(bytes)
            }
            StorageMode::Delta => Payload::Delta(bytes),
        };

        let entry = Entry {
            path: header.path.clone(),
            size: header.size,
            mode: header.mode,
            fingerprint: header.fingerprint,
            payload,
        };
        if entries.insert(header.path.clone(), entry).is_some() {
            return Err(Error::decode(format!("duplicate entry {}", header.path)));
        }
    }
    if cursor != body.len() {
        return Err(Error::decode("trailing bytes after last payload"));
    }
    for path in &meta.removed {
        validate_relative_path(path)?;
    }

    let kind = match meta.parent {
        None => SnapshotKind::Full,
        Some(parent) => SnapshotKind::Incremental { parent },
    };

    Ok(Snapshot {
        id: meta.id,
        timestamp: meta.timestamp,
        kind,
        label: meta.label,
        description: meta.description,
        entries,
        removed: meta.removed,
    })
}
