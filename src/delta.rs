//! Rsync-style differential transfer: block signatures of the old content,
//! and deltas that rebuild the new content out of copied blocks plus
//! literal bytes. Signatures travel from the side that *has* a file to the
//! side that wants to update it, deltas travel back.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::SyncError;

/// Signature / delta block granularity. Small enough that edits localize
/// well, large enough that signatures stay compact.
pub const BLOCK_SIZE: u32 = 4096;

/// Bytes of the SHA-256 digest kept per block. 16 bytes is plenty to make
/// rolling-checksum collisions harmless.
const STRONG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    pub rolling: u32,
    #[serde(with = "serde_bytes")]
    pub strong: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub block_size: u32,
    pub blocks: Vec<BlockSignature>,
}

impl Signature {
    /// The signature of a file that does not exist (zero blocks). A delta
    /// against this is simply the whole new content as literals.
    pub fn empty() -> Signature {
        Signature { block_size: BLOCK_SIZE, blocks: vec![] }
    }

    pub fn of(data: &[u8]) -> Signature {
        let mut b = SignatureBuilder::new(BLOCK_SIZE);
        b.update(data);
        b.finish()
    }
}

/// Streaming signature computation, so hashing and signing can share one
/// pass over the file.
pub struct SignatureBuilder {
    block_size: u32,
    buf: Vec<u8>,
    blocks: Vec<BlockSignature>,
}

impl SignatureBuilder {
    pub fn new(block_size: u32) -> SignatureBuilder {
        SignatureBuilder { block_size, buf: Vec::new(), blocks: Vec::new() }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        let bs = self.block_size as usize;
        while !data.is_empty() {
            let take = std::cmp::min(bs - self.buf.len(), data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == bs {
                self.blocks.push(block_signature(&self.buf));
                self.buf.clear();
            }
        }
    }

    pub fn finish(mut self) -> Signature {
        if !self.buf.is_empty() {
            self.blocks.push(block_signature(&self.buf));
        }
        Signature { block_size: self.block_size, blocks: self.blocks }
    }
}

fn block_signature(block: &[u8]) -> BlockSignature {
    let digest = Sha256::digest(block);
    BlockSignature {
        rolling: RollingChecksum::of(block).value(),
        strong: digest[..STRONG_LEN].to_vec(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy `count` consecutive blocks of the old content, starting at
    /// block `index`. Only the final block of a file may be short.
    Copy { index: u32, count: u32 },
    Literal(#[serde(with = "serde_bytes")] Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub block_size: u32,
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    /// A delta that replaces the old content wholesale, regardless of what
    /// the receiver currently holds. Used as the full-upload fallback after
    /// a hash mismatch.
    pub fn full(data: &[u8]) -> Delta {
        let ops = if data.is_empty() { vec![] } else { vec![DeltaOp::Literal(data.to_vec())] };
        Delta { block_size: BLOCK_SIZE, ops }
    }
}

/// The rsync rolling checksum (Adler-style, split into two 16-bit halves),
/// cheap to slide one byte at a time across the new content.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingChecksum {
    pub fn of(data: &[u8]) -> RollingChecksum {
        let mut c = RollingChecksum { a: 0, b: 0, len: data.len() as u32 };
        for (i, &x) in data.iter().enumerate() {
            c.a = c.a.wrapping_add(x as u32);
            c.b = c.b.wrapping_add((data.len() - i) as u32 * x as u32);
        }
        c.a &= 0xffff;
        c.b &= 0xffff;
        c
    }

    /// Slide the window one byte: drop `out` from the front, take `inc` at
    /// the back. Window length is unchanged.
    pub fn roll(&mut self, out: u8, inc: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(inc as u32) & 0xffff;
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(out as u32))
            .wrapping_add(self.a)
            & 0xffff;
    }

    pub fn value(&self) -> u32 {
        self.a | (self.b << 16)
    }
}

/// Computes the delta that turns the content described by `sig` into `new`.
pub fn diff(sig: &Signature, new: &[u8]) -> Delta {
    let bs = sig.block_size as usize;

    // Index full-size blocks by rolling checksum; the (at most one) short
    // tail block can only ever match at the very end of the new content.
    let mut by_rolling: std::collections::HashMap<u32, Vec<u32>> = std::collections::HashMap::new();
    for (i, b) in sig.blocks.iter().enumerate() {
        by_rolling.entry(b.rolling).or_default().push(i as u32);
    }

    let mut ops: Vec<DeltaOp> = Vec::new();
    let mut literal: Vec<u8> = Vec::new();
    let mut pos = 0usize;
    let mut rolling: Option<RollingChecksum> = None;

    while pos < new.len() {
        let window = std::cmp::min(bs, new.len() - pos);
        let checksum = match rolling {
            Some(c) => c,
            None => {
                let c = RollingChecksum::of(&new[pos..pos + window]);
                rolling = Some(c);
                c
            }
        };

        // The strong hash disambiguates: a window of the wrong length can't
        // reproduce the digest of a block with different content, so a
        // short tail window can only ever match the (short) final block.
        let matched = by_rolling.get(&checksum.value()).and_then(|candidates| {
            candidates.iter().copied().find(|&i| {
                sig.blocks[i as usize].strong == Sha256::digest(&new[pos..pos + window])[..STRONG_LEN]
            })
        });

        match matched {
            Some(index) => {
                flush_literal(&mut ops, &mut literal);
                push_copy(&mut ops, index);
                pos += window;
                rolling = None;
            }
            None => {
                literal.push(new[pos]);
                pos += 1;
                // Keep the checksum rolling while a full window remains
                if pos + window <= new.len() && window == bs {
                    let mut c = checksum;
                    c.roll(new[pos - 1], new[pos + window - 1]);
                    rolling = Some(c);
                } else {
                    rolling = None;
                }
            }
        }
    }
    flush_literal(&mut ops, &mut literal);

    Delta { block_size: sig.block_size, ops }
}

fn flush_literal(ops: &mut Vec<DeltaOp>, literal: &mut Vec<u8>) {
    if !literal.is_empty() {
        ops.push(DeltaOp::Literal(std::mem::take(literal)));
    }
}

fn push_copy(ops: &mut Vec<DeltaOp>, index: u32) {
    if let Some(DeltaOp::Copy { index: start, count }) = ops.last_mut() {
        if *start + *count == index {
            *count += 1;
            return;
        }
    }
    ops.push(DeltaOp::Copy { index, count: 1 });
}

/// Rebuilds the new content from the old content and a delta.
pub fn apply(old: &[u8], delta: &Delta) -> Result<Vec<u8>, SyncError> {
    let bs = delta.block_size as usize;
    if bs == 0 {
        return Err(SyncError::Delta("zero block size".to_string()));
    }
    let mut out = Vec::new();
    for op in &delta.ops {
        match op {
            DeltaOp::Literal(data) => out.extend_from_slice(data),
            DeltaOp::Copy { index, count } => {
                for i in *index..index.checked_add(*count).ok_or_else(|| {
                    SyncError::Delta("block range overflow".to_string())
                })? {
                    let start = i as usize * bs;
                    if start >= old.len() {
                        return Err(SyncError::Delta(format!(
                            "copy references block {i} beyond old content ({} bytes)",
                            old.len()
                        )));
                    }
                    let end = std::cmp::min(start + bs, old.len());
                    out.extend_from_slice(&old[start..end]);
                }
            }
        }
    }
    Ok(out)
}
