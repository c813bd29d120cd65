//! Binary deltas between two versions of a file.
//!
//! A delta records the length and fingerprint of the base it was computed
//! against, so applying it to the wrong base fails instead of producing
//! plausible-looking garbage.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hasher::{self, Fingerprint};
use crate::rolling_hash::WeakSum;

pub const MIN_BLOCK_SIZE: usize = 64;
pub const MAX_BLOCK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
struct Delta {
    base_len: u64,
    base_fingerprint: Fingerprint,
    target_len: u64,
    ops: Vec<DeltaOp>,
}

struct BlockSignature {
    weak: u32,
    strong: blake3::Hash,
    offset: usize,
}

/// Block size for a base of `len` bytes: roughly `sqrt(len)`, as rsync does.
pub fn block_size_for(len: usize) -> usize {
    let root = (len as f64).sqrt() as usize;
    root.next_power_of_two().clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

/// Compute a delta that turns `base` into `target`.
pub fn diff(base: &[u8], target: &[u8]) -> Vec<u8> {
    let delta = Delta {
        base_len: base.len() as u64,
        base_fingerprint: hasher::fingerprint(base),
        target_len: target.len() as u64,
        ops: compute_ops(base, target),
    };
    // Serializing plain owned data into a Vec cannot fail.
    bincode::serialize(&delta).unwrap_or_default()
}

/// Reconstruct the target from `base` and a delta produced by [`diff`].
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let delta: Delta = bincode::deserialize(delta)
        .map_err(|e| Error::corrupt_delta(format!("undecodable delta: {e}")))?;

    if delta.base_len != base.len() as u64 {
        return Err(Error::corrupt_delta(format!(
            "delta expects a {}-byte base, got {} bytes",
            delta.base_len,
            base.len()
        )));
    }
    let actual = hasher::fingerprint(base);
    if delta.base_fingerprint != actual {
        return Err(Error::corrupt_delta(format!(
            "base fingerprint mismatch: delta expects {}, base is {}",
            delta.base_fingerprint, actual
        )));
    }

    let target_len = usize::try_from(delta.target_len)
        .map_err(|_| Error::corrupt_delta("target length overflows usize"))?;
    let mut out = Vec::with_capacity(target_len.min(base.len() + (1 << 20)));

    for op in &delta.ops {
        match op {
            DeltaOp::Copy { offset, length } => {
                let start = *offset as usize;
                let end = offset
                    .checked_add(*length)
                    .filter(|&end| end <= base.len() as u64)
                    .ok_or_else(|| {
                        Error::corrupt_delta(format!(
                            "copy {offset}+{length} exceeds base length {}",
                            base.len()
                        ))
                    })? as usize;
                out.extend_from_slice(&base[start..end]);
            }
            DeltaOp::Insert { data } => out.extend_from_slice(data),
        }
        if out.len() > target_len {
            return Err(Error::corrupt_delta("output exceeds recorded target length"));
        }
    }

    if out.len() != target_len {
        return Err(Error::corrupt_delta(format!(
            "reconstructed {} bytes, expected {}",
            out.len(),
            target_len
        )));
    }
    Ok(out)
}

fn compute_ops(base: &[u8], target: &[u8]) -> Vec<DeltaOp> {
    let prefix = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = (base.len() - prefix).min(target.len() - prefix);
    let suffix = base
        .iter()
        .rev()
        .zip(target.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let mut ops = Vec::new();
    push_copy(&mut ops, 0, prefix);

    let middle = &target[prefix..target.len() - suffix];
    if !middle.is_empty() {
        for op in match_blocks(base, middle) {
            match op {
                DeltaOp::Copy { offset, length } => {
                    push_copy(&mut ops, offset as usize, length as usize)
                }
                insert => ops.push(insert),
            }
        }
    }

    push_copy(&mut ops, base.len() - suffix, suffix);
    ops
}

/// Append a copy, merging it into the previous op when the ranges are contiguous.
fn push_copy(ops: &mut Vec<DeltaOp>, offset: usize, length: usize) {
    if length == 0 {
        return;
    }
    if let Some(DeltaOp::Copy {
        offset: prev_offset,
        length: prev_length,
    }) = ops.last_mut()
    {
        if *prev_offset + *prev_length == offset as u64 {
            *prev_length += length as u64;
            return;
        }
    }
    ops.push(DeltaOp::Copy {
        offset: offset as u64,
        length: length as u64,
    });
}

/// rsync-style matching: index fixed-size blocks of `base`, then scan `target`
/// with a rolling checksum looking for them.
fn match_blocks(base: &[u8], target: &[u8]) -> Vec<DeltaOp> {
    let block = block_size_for(base.len());
    if base.len() < block || target.len() < block {
        return vec![DeltaOp::Insert {
            data: target.to_vec(),
        }];
    }

    let signatures: Vec<BlockSignature> = base
        .chunks_exact(block)
        .enumerate()
        .map(|(i, chunk)| BlockSignature {
            weak: WeakSum::of(chunk).value(),
            strong: blake3::hash(chunk),
            offset: i * block,
        })
        .collect();

    let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        table.entry(sig.weak).or_default().push(idx);
    }

    let mut ops = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut pos = 0usize;
    let mut weak = WeakSum::of(&target[..block]);

    while pos + block <= target.len() {
        let window = &target[pos..pos + block];
        let matched = table.get(&weak.value()).and_then(|candidates| {
            let strong = blake3::hash(window);
            candidates
                .iter()
                .map(|&idx| &signatures[idx])
                .find(|sig| sig.strong == strong)
        });

        match matched {
            Some(sig) => {
                if !pending.is_empty() {
                    ops.push(DeltaOp::Insert {
                        data: std::mem::take(&mut pending),
                    });
                }
                push_copy(&mut ops, sig.offset, block);
                pos += block;
                if pos + block <= target.len() {
                    weak = WeakSum::of(&target[pos..pos + block]);
                }
            }
            None => {
                pending.push(target[pos]);
                if pos + block < target.len() {
                    weak.roll(target[pos], target[pos + block]);
                }
                pos += 1;
            }
        }
    }

    pending.extend_from_slice(&target[pos..]);
    if !pending.is_empty() {
        ops.push(DeltaOp::Insert { data: pending });
    }
    ops
}
