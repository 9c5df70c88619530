//! Patch stores: the in-memory ordered log of not-yet-materialized
//! patches and its on-disk, append-only counterpart.
//!
//! `memory::PatchStore` is consumed directly by the cache's write path;
//! `disk::DiskPatchLog` is consulted only on startup (`load_patches`) and
//! from writeback's materialization step — opened once and then only
//! appended to or read from during recovery.

pub mod disk;
pub mod memory;
