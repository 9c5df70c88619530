//! On-disk patch log.
//!
//! An append-only file of length-prefixed, serialized [`Patch`] records:
//! an `fs4` exclusive lock taken for the file's lifetime, big-endian
//! length prefixes, and a replay pass on open that rebuilds in-memory
//! state from whatever is durable, landing in a
//! [`PatchStore`](super::memory::PatchStore).
//!
//! The serializer itself is out of scope here; a real deployment would
//! treat a configured region of the serializer as the patch log's
//! backing store. This reference implementation keeps it as an ordinary
//! file so the crate is independently testable without a real serializer.

use super::memory::PatchStore;
use crate::error::CResult;
use crate::patch::Patch;
use crate::version::BlockId;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fs4::FileExt;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

const REC_PATCH: u8 = 0;
/// Marks that every patch logged for a block before this record is
/// superseded by a full-block flush; replay drops them rather than
/// applying them on top of the freshly flushed data.
const REC_RESET: u8 = 1;

pub struct DiskPatchLog {
    path: PathBuf,
    file: std::fs::File,
}

impl DiskPatchLog {
    /// Opens the log at `path`, creating it (and its parent directory)
    /// if absent, and takes an exclusive lock for the lifetime of the
    /// handle.
    pub fn open(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive()?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Appends a batch of patches as one contiguous write, each framed as
    /// a record-type byte, a big-endian `u32` byte length, and the
    /// serialized patch.
    pub fn append(&mut self, patches: &[Patch]) -> CResult<()> {
        let mut w = BufWriter::new(&mut self.file);
        for patch in patches {
            let mut encoded = Vec::new();
            patch.serialize(&mut encoded)?;
            w.write_u8(REC_PATCH)?;
            w.write_u32::<BigEndian>(encoded.len() as u32)?;
            w.write_all(&encoded)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Appends a reset marker for `block_id`, so a replay after this point
    /// drops every patch logged for it before now. Written once a full
    /// flush has made those patches redundant.
    pub fn append_reset(&mut self, block_id: BlockId) -> CResult<()> {
        let mut w = BufWriter::new(&mut self.file);
        w.write_u8(REC_RESET)?;
        w.write_u64::<BigEndian>(block_id)?;
        w.flush()?;
        Ok(())
    }

    /// Replays the log from the start, rebuilding a [`PatchStore`]. An
    /// incomplete trailing record (a crash mid-append) is treated as the
    /// log's true end and the file is truncated to drop it, matching the
    /// recovery behavior of a log-structured store replaying after an
    /// unclean shutdown.
    pub fn load_patches(&mut self) -> CResult<PatchStore> {
        let mut store = PatchStore::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        enum Record {
            Patch(Patch),
            Reset(BlockId),
        }

        while pos < file_len {
            let mut read_one = || -> std::io::Result<(Record, u64)> {
                let tag = r.read_u8()?;
                match tag {
                    REC_PATCH => {
                        let len = r.read_u32::<BigEndian>()? as usize;
                        let mut body = vec![0u8; len];
                        r.read_exact(&mut body)?;
                        let patch = Patch::deserialize(&mut &body[..]).map_err(|e| {
                            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                        })?;
                        Ok((Record::Patch(patch), 1 + 4 + len as u64))
                    }
                    REC_RESET => {
                        let block_id = r.read_u64::<BigEndian>()?;
                        Ok((Record::Reset(block_id), 1 + 8))
                    }
                    other => Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unknown patch-log record tag {other}"),
                    )),
                }
            };

            match read_one() {
                Ok((Record::Patch(patch), record_len)) => {
                    pos += record_len;
                    store.store_patch(patch);
                }
                Ok((Record::Reset(block_id), record_len)) => {
                    pos += record_len;
                    let flushed_through = store.highest_counter_for_block(block_id);
                    store.drop_patches(block_id);
                    store.mark_materialized(block_id, flushed_through);
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!("truncating incomplete patch-log record at offset {pos}");
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchKind;
    use tempfile::tempdir;

    fn copy_patch(block_id: u64, counter: u64, byte: u8) -> Patch {
        Patch::new(block_id, counter, PatchKind::Copy { offset: 0, bytes: vec![byte] })
    }

    #[test]
    fn replays_appended_patches_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patches.log");

        {
            let mut log = DiskPatchLog::open(path.clone()).unwrap();
            log.append(&[copy_patch(1, 1, 0xAA), copy_patch(1, 2, 0xBB)]).unwrap();
        }

        let mut log = DiskPatchLog::open(path).unwrap();
        let store = log.load_patches().unwrap();
        let mut buf = vec![0u8; 1];
        store.apply_patches(1, &mut buf);
        assert_eq!(buf[0], 0xBB);
    }

    #[test]
    fn truncates_a_torn_trailing_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patches.log");
        {
            let mut log = DiskPatchLog::open(path.clone()).unwrap();
            log.append(&[copy_patch(1, 1, 0xAA)]).unwrap();
        }
        // Simulate a crash mid-write of a second record.
        {
            let file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            let mut w = BufWriter::new(file);
            w.write_u8(REC_PATCH).unwrap();
            w.write_u32::<BigEndian>(100).unwrap();
            w.write_all(&[1, 2, 3]).unwrap();
        }

        let full_len_before = std::fs::metadata(&path).unwrap().len();
        let mut log = DiskPatchLog::open(path.clone()).unwrap();
        let store = log.load_patches().unwrap();
        let full_len_after = std::fs::metadata(&path).unwrap().len();

        assert!(full_len_after < full_len_before);
        assert!(store.has_patches_for_block(1));
    }

    #[test]
    fn reset_drops_patches_logged_before_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patches.log");

        {
            let mut log = DiskPatchLog::open(path.clone()).unwrap();
            log.append(&[copy_patch(1, 1, 0xAA)]).unwrap();
            log.append_reset(1).unwrap();
            log.append(&[copy_patch(1, 2, 0xCC)]).unwrap();
        }

        let mut log = DiskPatchLog::open(path).unwrap();
        let store = log.load_patches().unwrap();
        let mut buf = vec![0u8; 1];
        store.apply_patches(1, &mut buf);
        assert_eq!(buf[0], 0xCC);
        assert_eq!(store.last_patch_materialized_or_zero(1), 1);
    }
}
