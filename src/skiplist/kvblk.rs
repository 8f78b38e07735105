//! # Key-Value Payload Blocks
//!
//! A payload block (KVBLK) carries the records of one skip-list node:
//! up to 63 packed (key, value) pairs behind a slot directory. Blocks come
//! in power-of-two size classes from 2 KiB to 512 MiB and are recycled
//! through per-class free lists.
//!
//! ## Block Layout
//!
//! ```text
//! +---------------------------+  offset 0
//! |  Header (12 bytes)        |  szpow, nslots, used, gaps
//! +---------------------------+  offset 12
//! |  Directory (63 x 16 B)    |  (key_off, key_len, val_off, val_len)
//! +---------------------------+  offset 1020 (KVBLK_PAYLOAD_OFF)
//! |  Payload                  |  keys and value regions, packed upward
//! |  ...                      |
//! +---------------------------+  offset 2^szpow
//! ```
//!
//! ## Directory Discipline
//!
//! Directory entries are kept dense and sorted by key, so the slot holding
//! the block's minimum key is always index 0 and lookups binary-search the
//! directory. Payload bytes are append-only: `used` is a high-water mark
//! and deleted or superseded regions remain behind as holes counted by
//! `gaps` until compaction rewrites the payload (triggered when holes
//! exceed a quarter of the block).
//!
//! A value's directory length (`val_len`) is the size of its *region*,
//! which may exceed the live bytes: duplicate-array values reserve
//! power-of-two capacity up front and track their own element count in
//! the first four region bytes.
//!
//! ## Write Ordering
//!
//! Payload bytes are written before the directory that references them,
//! so a torn flush can leave dead payload but never a directory entry
//! pointing at unwritten space.

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    KVBLK_COMPACT_DIV, KVBLK_HDR_SZ, KVBLK_MAX, KVBLK_MAX_SZPOW, KVBLK_MIN_SZPOW,
    KVBLK_PAYLOAD_OFF,
};
use crate::error::{Error, Result};
use crate::exfile::ExFile;
use crate::store::alloc::{alloc_kvblk, free_kvblk, szpow_for};
use crate::store::meta::Metablock;
use crate::zerocopy_accessors;

/// Outcome of a directory key search.
pub(crate) type SlotSearch = std::result::Result<usize, usize>;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct KvblkHdr {
    szpow: u8,
    nslots: u8,
    reserved: [u8; 2],
    used: U32,
    gaps: U32,
}

const _: () = assert!(std::mem::size_of::<KvblkHdr>() == KVBLK_HDR_SZ);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DirEnt {
    koff: U32,
    klen: U32,
    voff: U32,
    vlen: U32,
}

impl DirEnt {
    zerocopy_accessors! {
        voff: u32,
        vlen: u32,
    }

    #[inline]
    fn koff(&self) -> u32 {
        self.koff.get()
    }

    #[inline]
    fn klen(&self) -> u32 {
        self.klen.get()
    }

    fn new(koff: u32, klen: u32, voff: u32, vlen: u32) -> Self {
        Self {
            koff: U32::new(koff),
            klen: U32::new(klen),
            voff: U32::new(voff),
            vlen: U32::new(vlen),
        }
    }
}

/// Header + directory as they appear at the start of a block.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct KvblkMeta {
    hdr: KvblkHdr,
    dir: [DirEnt; KVBLK_MAX],
}

const _: () = assert!(std::mem::size_of::<KvblkMeta>() == KVBLK_PAYLOAD_OFF);

impl KvblkMeta {
    fn fresh(szpow: u8) -> Self {
        let mut m = KvblkMeta::new_zeroed();
        m.hdr.szpow = szpow;
        m
    }
}

/// In-memory handle to one payload block. The header and directory are
/// cached; payload bytes are read and written through the extendable file
/// on demand.
#[derive(Debug)]
pub(crate) struct Kvblk {
    off: u64,
    meta: KvblkMeta,
}

impl Kvblk {
    /// Allocates a block sized to hold `entries` (already sorted by key)
    /// and packs them. An empty slice yields an empty block of the
    /// smallest class.
    pub fn create_from_entries(
        mblk: &mut Metablock,
        exf: &mut ExFile,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<Self> {
        debug_assert!(entries.len() <= KVBLK_MAX);
        let need = KVBLK_PAYLOAD_OFF as u64
            + entries
                .iter()
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum::<u64>();
        let szpow = szpow_for(need)?;
        let off = alloc_kvblk(mblk, exf, szpow)?;
        let mut kv = Self {
            off,
            meta: KvblkMeta::fresh(szpow),
        };
        kv.rebuild(exf, entries)?;
        Ok(kv)
    }

    /// Loads and validates a block referenced by a node.
    pub fn load(exf: &ExFile, off: u64, expect_szpow: u8) -> Result<Self> {
        let mut buf = [0u8; KVBLK_PAYLOAD_OFF];
        exf.read_exact(off, &mut buf)?;
        let meta = KvblkMeta::read_from_bytes(&buf)
            .map_err(|e| Error::corrupted(format!("unreadable payload block at {off}: {e:?}")))?;

        let szpow = meta.hdr.szpow;
        if szpow != expect_szpow
            || !(KVBLK_MIN_SZPOW..=KVBLK_MAX_SZPOW).contains(&szpow)
        {
            return Err(Error::corrupted(format!(
                "payload block at {off} has size class {szpow}, expected {expect_szpow}"
            )));
        }
        let kv = Self { off, meta };
        let bsz = kv.block_size();
        if kv.nslots() > KVBLK_MAX
            || kv.meta.hdr.used.get() as u64 > kv.payload_cap()
            || kv.meta.hdr.gaps.get() > kv.meta.hdr.used.get()
        {
            return Err(Error::corrupted(format!(
                "payload block at {off} has inconsistent counters"
            )));
        }
        for i in 0..kv.nslots() {
            let e = &kv.meta.dir[i];
            let kend = e.koff() as u64 + e.klen() as u64;
            let vend = e.voff() as u64 + e.vlen() as u64;
            if e.klen() == 0
                || (e.koff() as usize) < KVBLK_PAYLOAD_OFF
                || kend > bsz
                || (e.voff() as usize) < KVBLK_PAYLOAD_OFF
                || vend > bsz
            {
                return Err(Error::corrupted(format!(
                    "payload block at {off} has directory entry {i} out of bounds"
                )));
            }
        }
        Ok(kv)
    }

    #[inline]
    pub fn off(&self) -> u64 {
        self.off
    }

    #[inline]
    pub fn szpow(&self) -> u8 {
        self.meta.hdr.szpow
    }

    #[inline]
    pub fn nslots(&self) -> usize {
        self.meta.hdr.nslots as usize
    }

    #[inline]
    pub fn block_size(&self) -> u64 {
        1u64 << self.meta.hdr.szpow
    }

    #[inline]
    fn payload_cap(&self) -> u64 {
        self.block_size() - KVBLK_PAYLOAD_OFF as u64
    }

    #[inline]
    fn free_tail(&self) -> u64 {
        self.payload_cap() - self.meta.hdr.used.get() as u64
    }

    /// True when a new record of `need` payload bytes fits without any
    /// reshuffling.
    pub fn has_room(&self, need: usize) -> bool {
        self.nslots() < KVBLK_MAX && self.free_tail() >= need as u64
    }

    /// True when a new record would fit after compacting holes away.
    pub fn can_make_room(&self, need: usize) -> bool {
        self.nslots() < KVBLK_MAX
            && self.free_tail() + self.meta.hdr.gaps.get() as u64 >= need as u64
    }

    fn write_meta(&self, exf: &mut ExFile) -> Result<()> {
        exf.write_all(self.off, self.meta.as_bytes())
    }

    /// Reads the key of slot `i`.
    pub fn key(&self, exf: &ExFile, i: usize) -> Result<Vec<u8>> {
        let e = &self.meta.dir[i];
        let mut buf = vec![0u8; e.klen() as usize];
        exf.read_exact(self.off + e.koff() as u64, &mut buf)?;
        Ok(buf)
    }

    /// Reads the full value region of slot `i` (live bytes plus any
    /// reserved capacity).
    pub fn value_region(&self, exf: &ExFile, i: usize) -> Result<Vec<u8>> {
        let e = &self.meta.dir[i];
        let mut buf = vec![0u8; e.vlen() as usize];
        exf.read_exact(self.off + e.voff() as u64, &mut buf)?;
        Ok(buf)
    }

    /// Binary-searches the sorted directory for `key`.
    pub fn find(&self, exf: &ExFile, key: &[u8]) -> Result<SlotSearch> {
        let mut lo = 0usize;
        let mut hi = self.nslots();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let k = self.key(exf, mid)?;
            match k.as_slice().cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Packs a new record at directory position `pos`, reserving
    /// `reserve >= val.len()` bytes for the value region. The caller has
    /// already verified the room.
    pub fn insert(
        &mut self,
        exf: &mut ExFile,
        pos: usize,
        key: &[u8],
        val: &[u8],
        reserve: usize,
    ) -> Result<()> {
        let n = self.nslots();
        debug_assert!(pos <= n && n < KVBLK_MAX);
        debug_assert!(val.len() <= reserve);
        debug_assert!(self.has_room(key.len() + reserve));

        let koff = KVBLK_PAYLOAD_OFF as u64 + self.meta.hdr.used.get() as u64;
        exf.write_all(self.off + koff, key)?;
        let voff = koff + key.len() as u64;
        exf.write_all(self.off + voff, val)?;

        self.meta.dir.copy_within(pos..n, pos + 1);
        self.meta.dir[pos] = DirEnt::new(
            koff as u32,
            key.len() as u32,
            voff as u32,
            reserve as u32,
        );
        self.meta.hdr.nslots += 1;
        let used = self.meta.hdr.used.get() + (key.len() + reserve) as u32;
        self.meta.hdr.used = U32::new(used);
        self.write_meta(exf)
    }

    /// Removes the record at directory position `i`, leaving its payload
    /// bytes as a hole. Compacts when holes exceed a quarter of the block.
    pub fn remove(&mut self, exf: &mut ExFile, i: usize) -> Result<()> {
        let n = self.nslots();
        debug_assert!(i < n);
        let e = self.meta.dir[i];

        self.meta.dir.copy_within(i + 1..n, i);
        self.meta.dir[n - 1] = DirEnt::new_zeroed();
        self.meta.hdr.nslots -= 1;
        let gaps = self.meta.hdr.gaps.get() + e.klen() + e.vlen();
        self.meta.hdr.gaps = U32::new(gaps);

        if gaps as u64 > self.block_size() / KVBLK_COMPACT_DIV {
            self.compact(exf)
        } else {
            self.write_meta(exf)
        }
    }

    fn append_value(&mut self, exf: &mut ExFile, i: usize, val: &[u8], reserve: usize) -> Result<()> {
        let voff = KVBLK_PAYLOAD_OFF as u64 + self.meta.hdr.used.get() as u64;
        exf.write_all(self.off + voff, val)?;
        let old = self.meta.dir[i].vlen();
        self.meta.dir[i].set_voff(voff as u32);
        self.meta.dir[i].set_vlen(reserve as u32);
        self.meta.hdr.used = U32::new(self.meta.hdr.used.get() + reserve as u32);
        self.meta.hdr.gaps = U32::new(self.meta.hdr.gaps.get() + old);
        self.write_meta(exf)
    }

    /// Replaces the value of slot `i` with `val` inside a region of
    /// `reserve` bytes. Returns `false` when the block cannot hold the new
    /// region even after compaction; the caller then relocates the block.
    pub fn update_value(
        &mut self,
        exf: &mut ExFile,
        i: usize,
        val: &[u8],
        reserve: usize,
    ) -> Result<bool> {
        debug_assert!(val.len() <= reserve);
        let old = self.meta.dir[i].vlen() as usize;
        if reserve <= old {
            let e = self.meta.dir[i];
            exf.write_all(self.off + e.voff() as u64, val)?;
            self.meta.dir[i].set_vlen(reserve as u32);
            self.meta.hdr.gaps = U32::new(self.meta.hdr.gaps.get() + (old - reserve) as u32);
            self.write_meta(exf)?;
            return Ok(true);
        }
        if self.free_tail() >= reserve as u64 {
            self.append_value(exf, i, val, reserve)?;
            return Ok(true);
        }
        let live = (self.meta.hdr.used.get() - self.meta.hdr.gaps.get()) as u64;
        if self.payload_cap() >= live + reserve as u64 {
            self.compact(exf)?;
            self.append_value(exf, i, val, reserve)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Rewrites the payload densely, dropping every hole.
    pub fn compact(&mut self, exf: &mut ExFile) -> Result<()> {
        let n = self.nslots();
        let mut bufs = Vec::with_capacity(n);
        for i in 0..n {
            bufs.push((self.key(exf, i)?, self.value_region(exf, i)?));
        }
        self.write_packed(exf, &bufs)
    }

    /// Reinitialises the block with `entries` (sorted by key).
    pub fn rebuild(&mut self, exf: &mut ExFile, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        self.meta = KvblkMeta::fresh(self.meta.hdr.szpow);
        self.write_packed(exf, entries)
    }

    fn write_packed(&mut self, exf: &mut ExFile, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        debug_assert!(entries.len() <= KVBLK_MAX);
        let mut used = 0u64;
        for (i, (k, v)) in entries.iter().enumerate() {
            let koff = KVBLK_PAYLOAD_OFF as u64 + used;
            exf.write_all(self.off + koff, k)?;
            let voff = koff + k.len() as u64;
            exf.write_all(self.off + voff, v)?;
            self.meta.dir[i] =
                DirEnt::new(koff as u32, k.len() as u32, voff as u32, v.len() as u32);
            used += (k.len() + v.len()) as u64;
        }
        for i in entries.len()..KVBLK_MAX {
            self.meta.dir[i] = DirEnt::new_zeroed();
        }
        self.meta.hdr.nslots = entries.len() as u8;
        self.meta.hdr.used = U32::new(used as u32);
        self.meta.hdr.gaps = U32::new(0);
        self.write_meta(exf)
    }

    /// Collects every record as (key, value region) pairs, in key order.
    pub fn entries(&self, exf: &ExFile) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::with_capacity(self.nslots());
        for i in 0..self.nslots() {
            out.push((self.key(exf, i)?, self.value_region(exf, i)?));
        }
        Ok(out)
    }

    /// Releases the block to its class free list.
    pub fn free(self, mblk: &mut Metablock, exf: &mut ExFile) -> Result<()> {
        free_kvblk(mblk, exf, self.off, self.meta.hdr.szpow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exfile::ExFileOpts;
    use crate::store::meta::meta_span;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, ExFile, Metablock) {
        let dir = tempdir().unwrap();
        let exf = ExFile::open(dir.path().join("kvblk.db"), ExFileOpts::default()).unwrap();
        let span = meta_span(exf.page_size());
        let meta = Metablock::new(exf.page_size() as u32, span);
        (dir, exf, meta)
    }

    fn insert_sorted(kv: &mut Kvblk, exf: &mut ExFile, key: &[u8], val: &[u8]) {
        let pos = kv.find(exf, key).unwrap().unwrap_err();
        kv.insert(exf, pos, key, val, val.len()).unwrap();
    }

    #[test]
    fn kvblk_meta_layout_is_pinned() {
        assert_eq!(std::mem::size_of::<KvblkMeta>(), 1020);
    }

    #[test]
    fn insert_and_find_keeps_sorted_order() {
        let (_dir, mut exf, mut meta) = setup();
        let mut kv = Kvblk::create_from_entries(&mut meta, &mut exf, &[]).unwrap();

        insert_sorted(&mut kv, &mut exf, b"charlie", b"3");
        insert_sorted(&mut kv, &mut exf, b"alpha", b"1");
        insert_sorted(&mut kv, &mut exf, b"bravo", b"2");

        assert_eq!(kv.nslots(), 3);
        assert_eq!(kv.key(&exf, 0).unwrap(), b"alpha");
        assert_eq!(kv.key(&exf, 1).unwrap(), b"bravo");
        assert_eq!(kv.key(&exf, 2).unwrap(), b"charlie");
        assert_eq!(kv.find(&exf, b"bravo").unwrap(), Ok(1));
        assert_eq!(kv.find(&exf, b"delta").unwrap(), Err(3));
        assert_eq!(kv.value_region(&exf, 1).unwrap(), b"2");
    }

    #[test]
    fn load_roundtrips_directory() {
        let (_dir, mut exf, mut meta) = setup();
        let mut kv = Kvblk::create_from_entries(&mut meta, &mut exf, &[]).unwrap();
        insert_sorted(&mut kv, &mut exf, b"key", b"value");

        let back = Kvblk::load(&exf, kv.off(), KVBLK_MIN_SZPOW).unwrap();

        assert_eq!(back.nslots(), 1);
        assert_eq!(back.key(&exf, 0).unwrap(), b"key");
        assert_eq!(back.value_region(&exf, 0).unwrap(), b"value");
    }

    #[test]
    fn load_rejects_size_class_mismatch() {
        let (_dir, mut exf, mut meta) = setup();
        let kv = Kvblk::create_from_entries(&mut meta, &mut exf, &[]).unwrap();

        let err = Kvblk::load(&exf, kv.off(), KVBLK_MIN_SZPOW + 1).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }

    #[test]
    fn remove_shifts_directory_down() {
        let (_dir, mut exf, mut meta) = setup();
        let mut kv = Kvblk::create_from_entries(&mut meta, &mut exf, &[]).unwrap();
        insert_sorted(&mut kv, &mut exf, b"a", b"1");
        insert_sorted(&mut kv, &mut exf, b"b", b"2");
        insert_sorted(&mut kv, &mut exf, b"c", b"3");

        kv.remove(&mut exf, 1).unwrap();

        assert_eq!(kv.nslots(), 2);
        assert_eq!(kv.key(&exf, 0).unwrap(), b"a");
        assert_eq!(kv.key(&exf, 1).unwrap(), b"c");
        assert_eq!(kv.find(&exf, b"b").unwrap(), Err(1));
    }

    #[test]
    fn heavy_deletion_triggers_compaction() {
        let (_dir, mut exf, mut meta) = setup();
        let mut kv = Kvblk::create_from_entries(&mut meta, &mut exf, &[]).unwrap();

        // Fill a noticeable share of the 2 KiB block.
        let val = vec![0xEE; 120];
        for c in b'a'..=b'f' {
            insert_sorted(&mut kv, &mut exf, &[c], &val);
        }
        let used_before = kv.meta.hdr.used.get();

        // Deleting most records pushes holes past block/4 and compacts.
        for _ in 0..5 {
            kv.remove(&mut exf, 0).unwrap();
        }

        assert_eq!(kv.nslots(), 1);
        assert_eq!(kv.meta.hdr.gaps.get(), 0);
        assert!(kv.meta.hdr.used.get() < used_before);
        assert_eq!(kv.key(&exf, 0).unwrap(), b"f");
        assert_eq!(kv.value_region(&exf, 0).unwrap(), val);
    }

    #[test]
    fn update_value_in_place_and_appended() {
        let (_dir, mut exf, mut meta) = setup();
        let mut kv = Kvblk::create_from_entries(&mut meta, &mut exf, &[]).unwrap();
        insert_sorted(&mut kv, &mut exf, b"k", b"initial");

        // Shrinking fits in place.
        assert!(kv.update_value(&mut exf, 0, b"new", 3).unwrap());
        assert_eq!(kv.value_region(&exf, 0).unwrap(), b"new");

        // Growing appends a fresh region.
        assert!(kv.update_value(&mut exf, 0, b"a much longer value", 19).unwrap());
        assert_eq!(kv.value_region(&exf, 0).unwrap(), b"a much longer value");
        assert_eq!(kv.key(&exf, 0).unwrap(), b"k");
    }

    #[test]
    fn update_value_compacts_when_tail_is_short() {
        let (_dir, mut exf, mut meta) = setup();
        let mut kv = Kvblk::create_from_entries(&mut meta, &mut exf, &[]).unwrap();
        let cap = kv.payload_cap() as usize;

        // One record whose region fills most of the block.
        let big = vec![1u8; cap - 200];
        insert_sorted(&mut kv, &mut exf, b"k", &big);
        // Shrink it, leaving a huge hole and a short tail.
        assert!(kv.update_value(&mut exf, 0, b"small", 5).unwrap());

        // Growing again only fits by reclaiming the hole.
        let medium = vec![2u8; cap - 300];
        assert!(kv.update_value(&mut exf, 0, &medium, medium.len()).unwrap());
        assert_eq!(kv.value_region(&exf, 0).unwrap(), medium);
    }

    #[test]
    fn update_value_reports_exhaustion() {
        let (_dir, mut exf, mut meta) = setup();
        let mut kv = Kvblk::create_from_entries(&mut meta, &mut exf, &[]).unwrap();
        insert_sorted(&mut kv, &mut exf, b"k", b"v");

        let oversized = vec![0u8; kv.payload_cap() as usize];
        assert!(!kv.update_value(&mut exf, 0, &oversized, oversized.len()).unwrap());
        // The record is untouched after a refused update.
        assert_eq!(kv.value_region(&exf, 0).unwrap(), b"v");
    }

    #[test]
    fn create_from_entries_picks_fitting_class() {
        let (_dir, mut exf, mut meta) = setup();

        let entries = vec![
            (b"a".to_vec(), vec![0u8; 3000]),
            (b"b".to_vec(), vec![1u8; 3000]),
        ];
        let kv = Kvblk::create_from_entries(&mut meta, &mut exf, &entries).unwrap();

        assert!(kv.block_size() >= KVBLK_PAYLOAD_OFF as u64 + 6002);
        assert_eq!(kv.nslots(), 2);
        assert_eq!(kv.value_region(&exf, 1).unwrap(), entries[1].1);
    }
}
