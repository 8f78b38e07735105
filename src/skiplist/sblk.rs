//! # Skip-List Node Blocks
//!
//! Every skip-list node occupies exactly one 256-byte block ([`Sblk`]).
//! A node references the payload block holding its records and carries the
//! forward-pointer array that forms the skip list.
//!
//! ## Block Layout (256 bytes)
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  ------------------------------------------
//! 0       1     flags       bit 0 = in use, bit 1 = database head
//! 1       1     level       node level, 1..=24
//! 2       1     pnum        live records in the payload block
//! 3       1     kv_szpow    payload block size class (power of two)
//! 4       4     dbid        owning database id
//! 8       8     kvblk_off   payload block offset (0 for the head)
//! 16      8     prev0       level-0 predecessor (0 = first node)
//! 24      192   next[24]    forward offsets, one per level (0 = none)
//! 216     4     key_len     full length of the first (minimum) key
//! 220     1     fence_len   bytes of the first key cached below
//! 221     35    fence       first-key prefix for fence comparisons
//! ```
//!
//! Freed blocks are overwritten by the allocator (flags drop to zero), so
//! a stale offset is detectable as "not in use".
//!
//! ## Fence Comparisons
//!
//! Search needs "is this node's minimum key <= target" at every step.
//! The fence caches up to 35 bytes of the minimum key; [`Sblk::fence_cmp`]
//! decides the comparison from the prefix alone whenever possible and
//! reports `None` in the single undecidable case (prefixes equal, both
//! keys longer than the cache), letting the engine fall back to reading
//! the full key from the payload block. The head sentinel compares below
//! everything.

use std::cmp::Ordering;

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{MAX_LEVEL, SBLK_FENCE_MAX, SBLK_SZ};
use crate::error::{Error, Result};
use crate::exfile::ExFile;
use crate::zerocopy_accessors;

/// Node is live (not on the free list).
pub(crate) const SBLK_USED: u8 = 0x01;
/// Node is a database head sentinel.
pub(crate) const SBLK_HEAD: u8 = 0x02;

/// One skip-list node block. See the module docs for the byte layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct Sblk {
    flags: u8,
    level: u8,
    pnum: u8,
    kv_szpow: u8,
    dbid: U32,
    kvblk_off: U64,
    prev0: U64,
    next: [U64; MAX_LEVEL],
    key_len: U32,
    fence_len: u8,
    fence: [u8; SBLK_FENCE_MAX],
}

const _: () = assert!(std::mem::size_of::<Sblk>() == SBLK_SZ);

impl Sblk {
    zerocopy_accessors! {
        kvblk_off: u64,
        prev0: u64,
    }

    #[inline]
    pub fn dbid(&self) -> u32 {
        self.dbid.get()
    }

    /// Creates the head sentinel for a database. The head has the maximum
    /// level, no payload block and an empty fence (the minimum key).
    pub fn new_head(dbid: u32) -> Self {
        let mut s = Sblk::new_zeroed();
        s.flags = SBLK_USED | SBLK_HEAD;
        s.level = MAX_LEVEL as u8;
        s.dbid = U32::new(dbid);
        s
    }

    /// Creates a data node of the given level. The payload block reference
    /// and fence are filled in by the caller.
    pub fn new_node(dbid: u32, level: u8) -> Self {
        debug_assert!((1..=MAX_LEVEL as u8).contains(&level));
        let mut s = Sblk::new_zeroed();
        s.flags = SBLK_USED;
        s.level = level;
        s.dbid = U32::new(dbid);
        s
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.flags & SBLK_USED != 0
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        self.flags & SBLK_HEAD != 0
    }

    #[inline]
    pub fn level(&self) -> usize {
        self.level as usize
    }

    #[inline]
    pub fn pnum(&self) -> u8 {
        self.pnum
    }

    pub fn set_pnum(&mut self, pnum: u8) {
        self.pnum = pnum;
    }

    #[inline]
    pub fn kv_szpow(&self) -> u8 {
        self.kv_szpow
    }

    pub fn set_kv_szpow(&mut self, szpow: u8) {
        self.kv_szpow = szpow;
    }

    #[inline]
    pub fn next_at(&self, level: usize) -> u64 {
        self.next[level].get()
    }

    pub fn set_next_at(&mut self, level: usize, off: u64) {
        self.next[level] = U64::new(off);
    }

    /// Caches `key` as this node's minimum key.
    pub fn set_fence(&mut self, key: &[u8]) {
        let flen = key.len().min(SBLK_FENCE_MAX);
        self.key_len = U32::new(key.len() as u32);
        self.fence_len = flen as u8;
        self.fence = [0u8; SBLK_FENCE_MAX];
        self.fence[..flen].copy_from_slice(&key[..flen]);
    }

    /// True when the fence holds the complete first key.
    pub fn fence_is_complete(&self) -> bool {
        self.fence_len as u32 == self.key_len.get()
    }

    /// The complete first key, when the fence holds all of it.
    pub fn fence_full_key(&self) -> Option<&[u8]> {
        if self.fence_is_complete() {
            Some(&self.fence[..self.fence_len as usize])
        } else {
            None
        }
    }

    /// Compares this node's first key against `key` using the cached
    /// fence. `None` means the fence cannot decide (equal prefixes, both
    /// keys longer than the cache) and the caller must read the full
    /// first key from the payload block.
    pub fn fence_cmp(&self, key: &[u8]) -> Option<Ordering> {
        if self.is_head() {
            // The sentinel sorts before every real key.
            return Some(Ordering::Less);
        }
        let flen = self.fence_len as usize;
        let full = self.key_len.get() as usize;
        let fence = &self.fence[..flen];
        let n = flen.min(key.len());
        match fence[..n].cmp(&key[..n]) {
            Ordering::Equal => {
                if flen == full {
                    Some(full.cmp(&key.len()))
                } else if key.len() <= flen {
                    // `key` is a strict prefix of the longer first key.
                    Some(Ordering::Greater)
                } else {
                    None
                }
            }
            ord => Some(ord),
        }
    }
}

/// Loads a node block without validating liveness. Cursor revalidation
/// uses this to inspect possibly-freed blocks.
pub(crate) fn sblk_load_raw(exf: &ExFile, off: u64) -> Result<Sblk> {
    let mut buf = [0u8; SBLK_SZ];
    exf.read_exact(off, &mut buf)?;
    Sblk::read_from_bytes(&buf)
        .map_err(|e| Error::corrupted(format!("unreadable node block at {off}: {e:?}")))
}

/// Loads a node block that is expected to be live.
pub(crate) fn sblk_load(exf: &ExFile, off: u64) -> Result<Sblk> {
    let s = sblk_load_raw(exf, off)?;
    if !s.is_used() {
        return Err(Error::corrupted(format!(
            "reference to freed node block at {off}"
        )));
    }
    if s.level == 0 || s.level as usize > MAX_LEVEL {
        return Err(Error::corrupted(format!(
            "node block at {off} has invalid level {}",
            s.level
        )));
    }
    Ok(s)
}

/// Writes a node block back to the file.
pub(crate) fn sblk_store(exf: &mut ExFile, off: u64, s: &Sblk) -> Result<()> {
    exf.write_all(off, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exfile::ExFileOpts;
    use tempfile::tempdir;

    #[test]
    fn sblk_size_is_pinned() {
        assert_eq!(std::mem::size_of::<Sblk>(), 256);
    }

    #[test]
    fn head_sentinel_sorts_below_everything() {
        let head = Sblk::new_head(1);

        assert!(head.is_head());
        assert_eq!(head.level(), MAX_LEVEL);
        assert_eq!(head.fence_cmp(b""), Some(Ordering::Less));
        assert_eq!(head.fence_cmp(b"anything"), Some(Ordering::Less));
    }

    #[test]
    fn complete_fence_decides_all_comparisons() {
        let mut s = Sblk::new_node(1, 3);
        s.set_fence(b"mango");

        assert_eq!(s.fence_cmp(b"mango"), Some(Ordering::Equal));
        assert_eq!(s.fence_cmp(b"zebra"), Some(Ordering::Less));
        assert_eq!(s.fence_cmp(b"apple"), Some(Ordering::Greater));
        // Shared prefix, different lengths.
        assert_eq!(s.fence_cmp(b"man"), Some(Ordering::Greater));
        assert_eq!(s.fence_cmp(b"mangos"), Some(Ordering::Less));
    }

    #[test]
    fn truncated_fence_decides_prefix_mismatches() {
        let long_key = [b'a'; 80];
        let mut s = Sblk::new_node(1, 1);
        s.set_fence(&long_key);
        assert!(!s.fence_is_complete());

        // Differs inside the cached prefix: decided.
        assert_eq!(s.fence_cmp(b"b"), Some(Ordering::Less));
        assert_eq!(s.fence_cmp(&[b'a', 0]), Some(Ordering::Greater));

        // Key is a prefix of the first key: first key is longer.
        assert_eq!(s.fence_cmp(&long_key[..10]), Some(Ordering::Greater));
        assert_eq!(s.fence_cmp(&long_key[..SBLK_FENCE_MAX]), Some(Ordering::Greater));
    }

    #[test]
    fn truncated_fence_reports_undecidable() {
        let long_key = [b'a'; 80];
        let mut s = Sblk::new_node(1, 1);
        s.set_fence(&long_key);

        // Both longer than the cache with equal prefixes: unknown.
        assert_eq!(s.fence_cmp(&[b'a'; 40]), None);
        assert_eq!(s.fence_cmp(&long_key), None);
    }

    #[test]
    fn load_store_roundtrip() {
        let dir = tempdir().unwrap();
        let mut exf = ExFile::open(dir.path().join("sblk.db"), ExFileOpts::default()).unwrap();

        let mut s = Sblk::new_node(7, 5);
        s.set_kvblk_off(0x2000);
        s.set_kv_szpow(11);
        s.set_pnum(3);
        s.set_prev0(0x100);
        s.set_next_at(0, 0x400);
        s.set_next_at(4, 0x800);
        s.set_fence(b"alpha");
        sblk_store(&mut exf, 4096, &s).unwrap();

        let back = sblk_load(&exf, 4096).unwrap();

        assert!(back.is_used());
        assert!(!back.is_head());
        assert_eq!(back.dbid(), 7);
        assert_eq!(back.level(), 5);
        assert_eq!(back.pnum(), 3);
        assert_eq!(back.kvblk_off(), 0x2000);
        assert_eq!(back.kv_szpow(), 11);
        assert_eq!(back.prev0(), 0x100);
        assert_eq!(back.next_at(0), 0x400);
        assert_eq!(back.next_at(4), 0x800);
        assert_eq!(back.fence_full_key(), Some(&b"alpha"[..]));
    }

    #[test]
    fn load_rejects_freed_blocks() {
        let dir = tempdir().unwrap();
        let mut exf = ExFile::open(dir.path().join("sblk.db"), ExFileOpts::default()).unwrap();
        exf.write_all(4096, &[0u8; SBLK_SZ]).unwrap();

        let err = sblk_load(&exf, 4096).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));

        // The raw variant still reads it for revalidation.
        let raw = sblk_load_raw(&exf, 4096).unwrap();
        assert!(!raw.is_used());
    }
}
