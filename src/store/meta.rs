//! # Metablock Definitions
//!
//! The metablock is the in-file root of a store. It occupies the start of
//! the file (rounded up to one page) and carries everything needed to find
//! the rest of the data:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------------------------------------------
//! 0       8     magic "SKIPSTR\0"
//! 8       1     version
//! 9       3     reserved
//! 12      4     page_size: system page size at creation time
//! 16      4     maxdbid: highest database id ever created
//! 20      2048  registry: 64 slots x 32 bytes (see DbSlot)
//! 2068    152   kv_free_heads: one list head per KVBLK size class
//! 2220    8     sblk_free_head: head of the 256-byte node free list
//! 2228    8     alloc_end: end of the allocated region (append watermark)
//! ```
//!
//! ## Registry Slots
//!
//! A slot binds a database id to its root node offset, creation flags,
//! level-coin seed and last-access timestamp. `dbid == 0` marks an empty
//! slot; live ids start at 1.
//!
//! ## Zerocopy Safety
//!
//! Both structs use zerocopy traits for safe, copy-free (de)serialization:
//! `FromBytes`, `IntoBytes`, `Immutable`, `KnownLayout` and `Unaligned`,
//! with every multi-byte field stored little-endian through
//! `zerocopy::little_endian` wrappers. Struct sizes are pinned by
//! compile-time assertions.
//!
//! The engine keeps one in-memory `Metablock` as the authoritative copy and
//! writes it back through the extendable file after every mutating
//! operation; the on-disk bytes are never patched field-by-field.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{KVBLK_CLASSES, MAX_DATABASES, STORE_MAGIC, STORE_VERSION};
use crate::error::{Error, Result};
use crate::exfile::round_up;
use crate::zerocopy_accessors;

/// Exact size of the serialized metablock in bytes.
pub(crate) const META_SZ: usize = std::mem::size_of::<Metablock>();

/// One database registry entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct DbSlot {
    dbid: U32,
    flags: U32,
    root_off: U64,
    seed: U64,
    last_access_ms: U64,
}

const _: () = assert!(std::mem::size_of::<DbSlot>() == 32);

impl DbSlot {
    zerocopy_accessors! {
        dbid: u32,
        flags: u32,
        root_off: u64,
        seed: u64,
        last_access_ms: u64,
    }

    pub fn is_empty(&self) -> bool {
        self.dbid.get() == 0
    }

    pub fn clear(&mut self) {
        *self = DbSlot::new_zeroed();
    }
}

/// In-file store root. See the module docs for the byte layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct Metablock {
    magic: [u8; 8],
    version: u8,
    reserved: [u8; 3],
    page_size: U32,
    maxdbid: U32,
    registry: [DbSlot; MAX_DATABASES],
    kv_free_heads: [U64; KVBLK_CLASSES],
    sblk_free_head: U64,
    alloc_end: U64,
}

const _: () = assert!(META_SZ == 20 + 32 * MAX_DATABASES + 8 * KVBLK_CLASSES + 16);

impl Metablock {
    zerocopy_accessors! {
        maxdbid: u32,
        sblk_free_head: u64,
        alloc_end: u64,
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    /// Creates a fresh metablock for a newly initialised store.
    pub fn new(page_size: u32, alloc_end: u64) -> Self {
        let mut m = Metablock::new_zeroed();
        m.magic = *STORE_MAGIC;
        m.version = STORE_VERSION;
        m.page_size = U32::new(page_size);
        m.alloc_end = U64::new(alloc_end);
        m
    }

    /// Parses and validates a metablock read from the file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < META_SZ {
            return Err(Error::corrupted(format!(
                "metablock too small: {} < {META_SZ}",
                bytes.len()
            )));
        }
        let m = Metablock::read_from_bytes(&bytes[..META_SZ])
            .map_err(|e| Error::corrupted(format!("failed to parse metablock: {e:?}")))?;
        if &m.magic != STORE_MAGIC {
            return Err(Error::corrupted("invalid store magic"));
        }
        if m.version != STORE_VERSION {
            return Err(Error::corrupted(format!(
                "unsupported store version {}",
                m.version
            )));
        }
        if m.page_size.get() == 0 {
            return Err(Error::corrupted("zero creation page size"));
        }
        Ok(m)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn slot(&self, idx: usize) -> &DbSlot {
        &self.registry[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut DbSlot {
        &mut self.registry[idx]
    }

    /// Index of the registry slot for `dbid`, if present.
    pub fn find_db(&self, dbid: u32) -> Option<usize> {
        self.registry.iter().position(|s| s.dbid() == dbid)
    }

    /// Index of the first empty registry slot, if any remain.
    pub fn free_slot_index(&self) -> Option<usize> {
        self.registry.iter().position(|s| s.is_empty())
    }

    pub fn kv_free_head(&self, class: usize) -> u64 {
        self.kv_free_heads[class].get()
    }

    pub fn set_kv_free_head(&mut self, class: usize, off: u64) {
        self.kv_free_heads[class] = U64::new(off);
    }
}

/// Bytes reserved at the start of the file for the metablock, rounded up
/// to the page size. Block allocation starts past this span.
pub(crate) fn meta_span(page_size: u64) -> u64 {
    round_up(META_SZ as u64, page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_slot_size_is_32_bytes() {
        assert_eq!(std::mem::size_of::<DbSlot>(), 32);
    }

    #[test]
    fn metablock_layout_is_stable() {
        assert_eq!(META_SZ, 2236);
    }

    #[test]
    fn fresh_metablock_has_no_databases() {
        let m = Metablock::new(4096, 4096);

        assert_eq!(m.maxdbid(), 0);
        assert_eq!(m.alloc_end(), 4096);
        assert_eq!(m.sblk_free_head(), 0);
        assert!(m.find_db(1).is_none());
        assert_eq!(m.free_slot_index(), Some(0));
    }

    #[test]
    fn metablock_roundtrip_through_bytes() {
        let mut m = Metablock::new(4096, 8192);
        m.set_maxdbid(3);
        m.set_sblk_free_head(0x1000);
        m.set_kv_free_head(0, 0x2000);
        let slot = m.slot_mut(5);
        slot.set_dbid(3);
        slot.set_flags(0x1);
        slot.set_root_off(0x3000);
        slot.set_seed(42);

        let parsed = Metablock::from_bytes(m.as_bytes()).unwrap();

        assert_eq!(parsed.version(), STORE_VERSION);
        assert_eq!(parsed.page_size(), 4096);
        assert_eq!(parsed.maxdbid(), 3);
        assert_eq!(parsed.sblk_free_head(), 0x1000);
        assert_eq!(parsed.kv_free_head(0), 0x2000);
        assert_eq!(parsed.find_db(3), Some(5));
        assert_eq!(parsed.slot(5).root_off(), 0x3000);
        assert_eq!(parsed.slot(5).seed(), 42);
    }

    #[test]
    fn metablock_rejects_invalid_magic() {
        let mut m = Metablock::new(4096, 4096);
        m.magic = *b"BADMAGIC";

        let err = Metablock::from_bytes(m.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }

    #[test]
    fn metablock_rejects_unknown_version() {
        let mut m = Metablock::new(4096, 4096);
        m.version = 99;

        let err = Metablock::from_bytes(m.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }

    #[test]
    fn cleared_slot_reads_empty() {
        let mut m = Metablock::new(4096, 4096);
        m.slot_mut(0).set_dbid(7);
        assert!(!m.slot(0).is_empty());

        m.slot_mut(0).clear();

        assert!(m.slot(0).is_empty());
        assert_eq!(m.slot(0).root_off(), 0);
    }

    #[test]
    fn meta_span_is_page_rounded() {
        assert_eq!(meta_span(4096), 4096);
        assert_eq!(meta_span(1024), 3072);
    }
}
