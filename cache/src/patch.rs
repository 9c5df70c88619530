//! Logical block mutations, as a tagged variant rather than a class
//! hierarchy.
//!
//! Each patch kind is one variant of [`Patch`], `apply` is a single
//! function matching on the tag, and serialization writes a 1-byte
//! discriminator ahead of the variant's payload, in the same
//! length-prefixed, byteorder-driven framing style used throughout this
//! crate's wire formats.

use crate::error::{CResult, Error};
use crate::version::{BlockId, PatchCounter};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchKind {
    /// Overwrite `bytes.len()` bytes starting at `offset`.
    Copy { offset: u32, bytes: Vec<u8> },
    /// memmove `len` bytes from `src` to `dst` within the same block.
    Move { src: u32, dst: u32, len: u32 },
    /// Insert a leaf-node key/value pair at `offset`, shifting the tail
    /// right by `pair.len()`.
    LeafInsert { offset: u32, pair: Vec<u8> },
    /// Remove `len` bytes at `offset`, shifting the tail left.
    LeafRemove { offset: u32, len: u32 },
    /// Shift `len` bytes starting at `offset` by a signed `delta`
    /// (negative shifts left, positive shifts right).
    LeafShift { offset: u32, len: u32, delta: i32 },
}

const TAG_COPY: u8 = 0;
const TAG_MOVE: u8 = 1;
const TAG_LEAF_INSERT: u8 = 2;
const TAG_LEAF_REMOVE: u8 = 3;
const TAG_LEAF_SHIFT: u8 = 4;

/// A logical mutation recorded against one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub block_id: BlockId,
    pub counter: PatchCounter,
    pub kind: PatchKind,
}

impl Patch {
    pub fn new(block_id: BlockId, counter: PatchCounter, kind: PatchKind) -> Self {
        Self { block_id, counter, kind }
    }

    /// Applies this patch's mutation to `buf` in place.
    pub fn apply(&self, buf: &mut [u8]) {
        match &self.kind {
            PatchKind::Copy { offset, bytes } => {
                let start = *offset as usize;
                buf[start..start + bytes.len()].copy_from_slice(bytes);
            }
            PatchKind::Move { src, dst, len } => {
                let (src, dst, len) = (*src as usize, *dst as usize, *len as usize);
                buf.copy_within(src..src + len, dst);
            }
            PatchKind::LeafInsert { offset, pair } => {
                let start = *offset as usize;
                let tail_len = buf.len() - start - pair.len();
                buf.copy_within(start..start + tail_len, start + pair.len());
                buf[start..start + pair.len()].copy_from_slice(pair);
            }
            PatchKind::LeafRemove { offset, len } => {
                let (start, len) = (*offset as usize, *len as usize);
                let tail_start = start + len;
                let tail_len = buf.len() - tail_start;
                buf.copy_within(tail_start..tail_start + tail_len, start);
            }
            PatchKind::LeafShift { offset, len, delta } => {
                let (start, len) = (*offset as usize, *len as usize);
                let new_start = (start as i64 + *delta as i64) as usize;
                buf.copy_within(start..start + len, new_start);
            }
        }
    }

    /// Estimated bytes this patch accounts for against the per-block
    /// patch budget.
    pub fn affected_data_size(&self) -> u64 {
        let payload = match &self.kind {
            PatchKind::Copy { bytes, .. } => bytes.len(),
            PatchKind::Move { .. } => 0,
            PatchKind::LeafInsert { pair, .. } => pair.len(),
            PatchKind::LeafRemove { .. } => 0,
            PatchKind::LeafShift { .. } => 0,
        };
        // Fixed header: tag + block_id + counter + kind-specific scalars.
        (1 + 8 + 8 + 16 + payload) as u64
    }

    pub fn serialize(&self, w: &mut impl Write) -> CResult<()> {
        match &self.kind {
            PatchKind::Copy { .. } => w.write_u8(TAG_COPY)?,
            PatchKind::Move { .. } => w.write_u8(TAG_MOVE)?,
            PatchKind::LeafInsert { .. } => w.write_u8(TAG_LEAF_INSERT)?,
            PatchKind::LeafRemove { .. } => w.write_u8(TAG_LEAF_REMOVE)?,
            PatchKind::LeafShift { .. } => w.write_u8(TAG_LEAF_SHIFT)?,
        }
        w.write_u64::<BigEndian>(self.block_id)?;
        w.write_u64::<BigEndian>(self.counter)?;
        match &self.kind {
            PatchKind::Copy { offset, bytes } => {
                w.write_u32::<BigEndian>(*offset)?;
                w.write_u32::<BigEndian>(bytes.len() as u32)?;
                w.write_all(bytes)?;
            }
            PatchKind::Move { src, dst, len } => {
                w.write_u32::<BigEndian>(*src)?;
                w.write_u32::<BigEndian>(*dst)?;
                w.write_u32::<BigEndian>(*len)?;
            }
            PatchKind::LeafInsert { offset, pair } => {
                w.write_u32::<BigEndian>(*offset)?;
                w.write_u32::<BigEndian>(pair.len() as u32)?;
                w.write_all(pair)?;
            }
            PatchKind::LeafRemove { offset, len } => {
                w.write_u32::<BigEndian>(*offset)?;
                w.write_u32::<BigEndian>(*len)?;
            }
            PatchKind::LeafShift { offset, len, delta } => {
                w.write_u32::<BigEndian>(*offset)?;
                w.write_u32::<BigEndian>(*len)?;
                w.write_i32::<BigEndian>(*delta)?;
            }
        }
        Ok(())
    }

    pub fn deserialize(r: &mut impl Read) -> CResult<Self> {
        let tag = r.read_u8()?;
        let block_id = r.read_u64::<BigEndian>()?;
        let counter = r.read_u64::<BigEndian>()?;
        let kind = match tag {
            TAG_COPY => {
                let offset = r.read_u32::<BigEndian>()?;
                let len = r.read_u32::<BigEndian>()? as usize;
                let mut bytes = vec![0u8; len];
                r.read_exact(&mut bytes)?;
                PatchKind::Copy { offset, bytes }
            }
            TAG_MOVE => {
                let src = r.read_u32::<BigEndian>()?;
                let dst = r.read_u32::<BigEndian>()?;
                let len = r.read_u32::<BigEndian>()?;
                PatchKind::Move { src, dst, len }
            }
            TAG_LEAF_INSERT => {
                let offset = r.read_u32::<BigEndian>()?;
                let len = r.read_u32::<BigEndian>()? as usize;
                let mut pair = vec![0u8; len];
                r.read_exact(&mut pair)?;
                PatchKind::LeafInsert { offset, pair }
            }
            TAG_LEAF_REMOVE => {
                let offset = r.read_u32::<BigEndian>()?;
                let len = r.read_u32::<BigEndian>()?;
                PatchKind::LeafRemove { offset, len }
            }
            TAG_LEAF_SHIFT => {
                let offset = r.read_u32::<BigEndian>()?;
                let len = r.read_u32::<BigEndian>()?;
                let delta = r.read_i32::<BigEndian>()?;
                PatchKind::LeafShift { offset, len, delta }
            }
            other => return Err(Error::Corruption(format!("unknown patch tag {other}"))),
        };
        Ok(Patch { block_id, counter, kind })
    }
}
