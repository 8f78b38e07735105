//! # Skip-List Engine
//!
//! The on-disk index of one database: a skip list whose nodes are 256-byte
//! [`sblk::Sblk`] blocks referencing [`kvblk::Kvblk`] payload blocks. The
//! engine owns search, insert, delete and node splitting; block space
//! comes from the store's allocator and all bytes move through the
//! extendable file.
//!
//! ## Structure
//!
//! ```text
//! head (level 24, no payload)
//!   │ next[3] ─────────────────────────────┐
//!   │ next[1] ───────────┐                 │
//!   │ next[0] ──┐        │                 │
//!   v           v        v                 v
//! [sentinel]  [a..e]   [f..m]   [n..r]   [s..z]
//!                │<──────│<───────│<────────│     prev0 chain
//! ```
//!
//! Each data node packs up to 63 records in key order; the node's minimum
//! key is cached on the node as a fence. Search descends from the head's
//! top level, advancing while the next node's first key is <= the target,
//! and lands on the single node whose key range can contain the target.
//!
//! ## Insert
//!
//! A new record packs into the target node when the directory and payload
//! have room (compacting holes or relocating the payload block to a larger
//! size class when only contiguous space is short). A full directory
//! splits the node: the upper half of its records moves to a fresh node
//! whose level is drawn from a geometric coin (p = 1/4, truncated to
//! 1..=24), wired in after the target on shared levels and through the
//! search-path predecessors above them.
//!
//! ## Delete
//!
//! Removing the last record of a node unlinks the node from every level
//! (fixing the level-0 back pointer) and releases both blocks to the free
//! lists. Removing the minimum record recomputes the fence.
//!
//! ## Ordering Hazards
//!
//! Multi-node updates write payload before directory and child pointers
//! before the nodes that point at them, so a torn flush leaves garbage
//! space but never a reachable reference to unwritten bytes.

pub(crate) mod kvblk;
pub(crate) mod sblk;

use std::cmp::Ordering;

use rand::rngs::SmallRng;
use rand::Rng;
use smallvec::SmallVec;

use crate::config::{KVBLK_MAX, KVBLK_MAX_SZPOW, KVBLK_PAYLOAD_OFF, MAX_LEVEL};
use crate::dup;
use crate::error::{Error, Result};
use crate::exfile::ExFile;
use crate::store::alloc::{alloc_sblk, free_sblk, szpow_for};
use crate::store::meta::Metablock;
use kvblk::Kvblk;
use sblk::{sblk_load, sblk_store, Sblk};

/// How a `put` interprets the caller's value bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PutMode {
    /// Plain record value; replaces any existing value.
    Basic { no_overwrite: bool },
    /// One element to insert into the sorted duplicate array.
    DupAdd { width: usize },
    /// One element to remove from the sorted duplicate array.
    DupRemove { width: usize },
}

/// Result of a skip-list descent: the per-level predecessors captured on
/// the way down, and the candidate node whose range contains the key.
pub(crate) struct Search {
    pub preds: [u64; MAX_LEVEL],
    pub node: Option<u64>,
}

/// Draws a node level from a geometric distribution with p = 1/4,
/// truncated to `1..=MAX_LEVEL`.
fn random_level(rng: &mut SmallRng) -> u8 {
    let mut level = 1u8;
    while level < MAX_LEVEL as u8 && rng.gen_range(0..4u32) == 0 {
        level += 1;
    }
    level
}

/// The complete first key of a node, from the fence when it holds all of
/// it, otherwise from the payload block.
fn first_key(exf: &ExFile, s: &Sblk) -> Result<Vec<u8>> {
    if let Some(k) = s.fence_full_key() {
        return Ok(k.to_vec());
    }
    let kv = load_node_kv(exf, s)?;
    if kv.nslots() == 0 {
        return Err(Error::corrupted("data node with no records"));
    }
    kv.key(exf, 0)
}

/// Compares a node's first key against `key`, falling back to the payload
/// block only when the fence cannot decide.
fn cmp_first_key(exf: &ExFile, s: &Sblk, key: &[u8]) -> Result<Ordering> {
    match s.fence_cmp(key) {
        Some(ord) => Ok(ord),
        None => Ok(first_key(exf, s)?.as_slice().cmp(key)),
    }
}

fn load_node_kv(exf: &ExFile, s: &Sblk) -> Result<Kvblk> {
    if s.kvblk_off() == 0 {
        return Err(Error::corrupted("data node without a payload block"));
    }
    let kv = Kvblk::load(exf, s.kvblk_off(), s.kv_szpow())?;
    if kv.nslots() != s.pnum() as usize {
        return Err(Error::corrupted(
            "node and payload block disagree on record count",
        ));
    }
    Ok(kv)
}

/// Top-down skip-list descent. With `strict` the walk advances only while
/// the next node's first key is strictly below `key`, yielding the true
/// predecessors of the node owning `key` (used for unlinking); otherwise
/// it advances on `<=`, landing on the candidate node itself.
pub(crate) fn search(
    exf: &ExFile,
    root_off: u64,
    root: &Sblk,
    key: &[u8],
    strict: bool,
) -> Result<Search> {
    let mut preds = [root_off; MAX_LEVEL];
    let mut cur_off = root_off;
    let mut cur = *root;
    for lvl in (0..MAX_LEVEL).rev() {
        loop {
            let nxt = cur.next_at(lvl);
            if nxt == 0 {
                break;
            }
            let ns = sblk_load(exf, nxt)?;
            let ord = cmp_first_key(exf, &ns, key)?;
            let advance = if strict {
                ord == Ordering::Less
            } else {
                ord != Ordering::Greater
            };
            if !advance {
                break;
            }
            cur_off = nxt;
            cur = ns;
        }
        preds[lvl] = cur_off;
    }
    Ok(Search {
        preds,
        node: (cur_off != root_off).then_some(cur_off),
    })
}

/// Small write-back cache for predecessor nodes touched while re-wiring
/// pointers; a predecessor reached on several levels is loaded and stored
/// once.
struct PredCache {
    nodes: SmallVec<[(u64, Sblk); 4]>,
}

impl PredCache {
    fn new() -> Self {
        Self {
            nodes: SmallVec::new(),
        }
    }

    fn get_mut(&mut self, exf: &ExFile, off: u64) -> Result<&mut Sblk> {
        if let Some(i) = self.nodes.iter().position(|(o, _)| *o == off) {
            return Ok(&mut self.nodes[i].1);
        }
        let s = sblk_load(exf, off)?;
        self.nodes.push((off, s));
        Ok(&mut self.nodes.last_mut().unwrap().1)
    }

    fn flush(&self, exf: &mut ExFile) -> Result<()> {
        for (off, s) in &self.nodes {
            sblk_store(exf, *off, s)?;
        }
        Ok(())
    }
}

/// Threads a freshly built node into the list. With `after`, the node goes
/// immediately behind that node on every shared level; levels above it are
/// wired through the captured predecessors. The node is stored before any
/// predecessor points at it, so the chain never references unwritten
/// space.
fn wire_new_node(
    exf: &mut ExFile,
    preds: &[u64; MAX_LEVEL],
    after: Option<(u64, &mut Sblk)>,
    s_off: u64,
    s: &mut Sblk,
) -> Result<()> {
    let slvl = s.level();
    let mut cache = PredCache::new();
    match after {
        Some((t_off, t)) => {
            let tlvl = t.level();
            for l in 0..slvl.min(tlvl) {
                s.set_next_at(l, t.next_at(l));
                t.set_next_at(l, s_off);
            }
            for l in tlvl..slvl {
                let p = cache.get_mut(exf, preds[l])?;
                s.set_next_at(l, p.next_at(l));
                p.set_next_at(l, s_off);
            }
            s.set_prev0(t_off);
        }
        None => {
            for l in 0..slvl {
                let p = cache.get_mut(exf, preds[l])?;
                s.set_next_at(l, p.next_at(l));
                p.set_next_at(l, s_off);
            }
            s.set_prev0(0);
        }
    }
    sblk_store(exf, s_off, s)?;
    if s.next_at(0) != 0 {
        let noff = s.next_at(0);
        let mut n = sblk_load(exf, noff)?;
        n.set_prev0(s_off);
        sblk_store(exf, noff, &n)?;
    }
    cache.flush(exf)
}

fn padded_region(bytes: &[u8], reserve: usize) -> Vec<u8> {
    debug_assert!(reserve >= bytes.len());
    let mut region = Vec::with_capacity(reserve);
    region.extend_from_slice(bytes);
    region.resize(reserve, 0);
    region
}

fn entries_need(entries: &[(Vec<u8>, Vec<u8>)]) -> u64 {
    KVBLK_PAYLOAD_OFF as u64
        + entries
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum::<u64>()
}

/// Clamps a value-region reservation so the record always fits the largest
/// block class; live bytes that cannot fit at all are a record-size error.
fn clamp_reserve(klen: usize, live: usize, reserve: usize) -> Result<usize> {
    let max_region = (1usize << KVBLK_MAX_SZPOW).saturating_sub(KVBLK_PAYLOAD_OFF + klen);
    if live > max_region {
        return Err(Error::MaxKvSize);
    }
    Ok(reserve.min(max_region).max(live))
}

/// Creates the head sentinel of a new database and returns its offset.
pub(crate) fn create_head(exf: &mut ExFile, meta: &mut Metablock, dbid: u32) -> Result<u64> {
    let off = alloc_sblk(meta, exf)?;
    let head = Sblk::new_head(dbid);
    sblk_store(exf, off, &head)?;
    Ok(off)
}

/// Stores a record. The caller has validated key shape and record size;
/// `mode` decides how the value bytes are interpreted.
pub(crate) fn put(
    exf: &mut ExFile,
    meta: &mut Metablock,
    root_off: u64,
    dbid: u32,
    rng: &mut SmallRng,
    key: &[u8],
    val: &[u8],
    mode: PutMode,
) -> Result<()> {
    put_impl(exf, meta, root_off, dbid, rng, key, val, mode, 0)
}

#[allow(clippy::too_many_arguments)]
fn put_impl(
    exf: &mut ExFile,
    meta: &mut Metablock,
    root_off: u64,
    dbid: u32,
    rng: &mut SmallRng,
    key: &[u8],
    val: &[u8],
    mode: PutMode,
    depth: u8,
) -> Result<()> {
    if depth > 4 {
        return Err(Error::corrupted("skip-list insert did not converge"));
    }
    let root = sblk_load(exf, root_off)?;
    let sr = search(exf, root_off, &root, key, false)?;

    let t_off = match sr.node {
        Some(t) => t,
        None => {
            let first = root.next_at(0);
            if first == 0 {
                return match mode {
                    PutMode::DupRemove { .. } => Err(Error::NotFound),
                    _ => create_first_node(exf, meta, dbid, rng, &sr.preds, key, val, mode),
                };
            }
            // The key sorts before every record; it lands in the first
            // node and becomes its new minimum.
            first
        }
    };

    let mut t = sblk_load(exf, t_off)?;
    let mut kv = load_node_kv(exf, &t)?;

    match kv.find(exf, key)? {
        Ok(i) => {
            let change = match mode {
                PutMode::Basic { no_overwrite: true } => return Err(Error::KeyExists),
                PutMode::Basic { .. } => Some((val.to_vec(), val.len())),
                PutMode::DupAdd { width } => {
                    let region = kv.value_region(exf, i)?;
                    dup::add(&region, width, dup::decode_elem(val, width)?)?
                }
                PutMode::DupRemove { width } => {
                    let region = kv.value_region(exf, i)?;
                    dup::remove(&region, width, dup::decode_elem(val, width)?)?
                }
            };
            let Some((bytes, reserve)) = change else {
                return Ok(());
            };
            let reserve = clamp_reserve(key.len(), bytes.len(), reserve)?;
            if kv.update_value(exf, i, &bytes, reserve)? {
                return Ok(());
            }
            // The block cannot hold the grown value: relocate it to a
            // larger class, or split the node when even the largest class
            // cannot carry all records together.
            let mut entries = kv.entries(exf)?;
            entries[i].1 = padded_region(&bytes, reserve);
            if szpow_for(entries_need(&entries)).is_ok() {
                let new_kv = Kvblk::create_from_entries(meta, exf, &entries)?;
                kv.free(meta, exf)?;
                t.set_kvblk_off(new_kv.off());
                t.set_kv_szpow(new_kv.szpow());
                sblk_store(exf, t_off, &t)?;
                Ok(())
            } else {
                split_node(exf, meta, dbid, rng, &sr.preds, t_off, &mut t, &mut kv)?;
                put_impl(exf, meta, root_off, dbid, rng, key, val, mode, depth + 1)
            }
        }
        Err(pos) => {
            let dup_buf;
            let (vbytes, reserve): (&[u8], usize) = match mode {
                PutMode::DupRemove { .. } => return Err(Error::NotFound),
                PutMode::DupAdd { width } => {
                    let v = dup::decode_elem(val, width)?;
                    dup_buf = dup::new_array(width, v);
                    (&dup_buf.0, dup_buf.1)
                }
                PutMode::Basic { .. } => (val, val.len()),
            };
            let reserve = clamp_reserve(key.len(), vbytes.len(), reserve)?;
            let need = key.len() + reserve;

            if t.pnum() as usize >= KVBLK_MAX {
                split_node(exf, meta, dbid, rng, &sr.preds, t_off, &mut t, &mut kv)?;
                return put_impl(exf, meta, root_off, dbid, rng, key, val, mode, depth + 1);
            }
            if kv.has_room(need) {
                kv.insert(exf, pos, key, vbytes, reserve)?;
            } else if kv.can_make_room(need) {
                kv.compact(exf)?;
                kv.insert(exf, pos, key, vbytes, reserve)?;
            } else {
                let mut entries = kv.entries(exf)?;
                entries.insert(pos, (key.to_vec(), padded_region(vbytes, reserve)));
                if szpow_for(entries_need(&entries)).is_ok() {
                    let new_kv = Kvblk::create_from_entries(meta, exf, &entries)?;
                    kv.free(meta, exf)?;
                    t.set_kvblk_off(new_kv.off());
                    t.set_kv_szpow(new_kv.szpow());
                } else {
                    split_node(exf, meta, dbid, rng, &sr.preds, t_off, &mut t, &mut kv)?;
                    return put_impl(exf, meta, root_off, dbid, rng, key, val, mode, depth + 1);
                }
            }
            t.set_pnum(t.pnum() + 1);
            if pos == 0 {
                t.set_fence(key);
            }
            sblk_store(exf, t_off, &t)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_first_node(
    exf: &mut ExFile,
    meta: &mut Metablock,
    dbid: u32,
    rng: &mut SmallRng,
    preds: &[u64; MAX_LEVEL],
    key: &[u8],
    val: &[u8],
    mode: PutMode,
) -> Result<()> {
    let (bytes, reserve) = match mode {
        PutMode::Basic { .. } => (val.to_vec(), val.len()),
        PutMode::DupAdd { width } => {
            let v = dup::decode_elem(val, width)?;
            dup::new_array(width, v)
        }
        PutMode::DupRemove { .. } => unreachable!("caller rejects DupRemove on empty database"),
    };
    let reserve = clamp_reserve(key.len(), bytes.len(), reserve)?;
    let entries = vec![(key.to_vec(), padded_region(&bytes, reserve))];
    let kv = Kvblk::create_from_entries(meta, exf, &entries)?;

    let s_off = alloc_sblk(meta, exf)?;
    let mut s = Sblk::new_node(dbid, random_level(rng));
    s.set_kvblk_off(kv.off());
    s.set_kv_szpow(kv.szpow());
    s.set_pnum(1);
    s.set_fence(key);
    wire_new_node(exf, preds, None, s_off, &mut s)
}

/// Moves the upper half of a node's records to a fresh node wired in
/// right behind it.
#[allow(clippy::too_many_arguments)]
fn split_node(
    exf: &mut ExFile,
    meta: &mut Metablock,
    dbid: u32,
    rng: &mut SmallRng,
    preds: &[u64; MAX_LEVEL],
    t_off: u64,
    t: &mut Sblk,
    kv: &mut Kvblk,
) -> Result<()> {
    let entries = kv.entries(exf)?;
    if entries.len() < 2 {
        return Err(Error::corrupted("cannot split a node with a single record"));
    }
    let mid = entries.len() / 2;
    let (lower, upper) = entries.split_at(mid);

    let s_kv = Kvblk::create_from_entries(meta, exf, upper)?;
    let s_off = alloc_sblk(meta, exf)?;
    let mut s = Sblk::new_node(dbid, random_level(rng));
    s.set_kvblk_off(s_kv.off());
    s.set_kv_szpow(s_kv.szpow());
    s.set_pnum(upper.len() as u8);
    s.set_fence(&upper[0].0);
    wire_new_node(exf, preds, Some((t_off, t)), s_off, &mut s)?;

    kv.rebuild(exf, lower)?;
    t.set_pnum(lower.len() as u8);
    sblk_store(exf, t_off, t)
}

/// Fetches the value region stored under `key`.
pub(crate) fn get(exf: &ExFile, root_off: u64, root: &Sblk, key: &[u8]) -> Result<Vec<u8>> {
    let sr = search(exf, root_off, root, key, false)?;
    let t_off = sr.node.ok_or(Error::NotFound)?;
    let t = sblk_load(exf, t_off)?;
    let kv = load_node_kv(exf, &t)?;
    match kv.find(exf, key)? {
        Ok(i) => kv.value_region(exf, i),
        Err(_) => Err(Error::NotFound),
    }
}

/// Removes the record under `key`.
pub(crate) fn del(
    exf: &mut ExFile,
    meta: &mut Metablock,
    root_off: u64,
    key: &[u8],
) -> Result<()> {
    let root = sblk_load(exf, root_off)?;
    let sr = search(exf, root_off, &root, key, false)?;
    let t_off = sr.node.ok_or(Error::NotFound)?;
    let mut t = sblk_load(exf, t_off)?;
    let mut kv = load_node_kv(exf, &t)?;
    let i = match kv.find(exf, key)? {
        Ok(i) => i,
        Err(_) => return Err(Error::NotFound),
    };

    if kv.nslots() == 1 {
        // The node empties: unlink it from every level it participates in
        // and release both blocks.
        let strict = search(exf, root_off, &root, key, true)?;
        let mut cache = PredCache::new();
        for l in 0..t.level() {
            let p = cache.get_mut(exf, strict.preds[l])?;
            if p.next_at(l) != t_off {
                return Err(Error::corrupted("skip-list chain mismatch during unlink"));
            }
            p.set_next_at(l, t.next_at(l));
        }
        cache.flush(exf)?;
        if t.next_at(0) != 0 {
            let noff = t.next_at(0);
            let mut n = sblk_load(exf, noff)?;
            n.set_prev0(t.prev0());
            sblk_store(exf, noff, &n)?;
        }
        kv.free(meta, exf)?;
        free_sblk(meta, exf, t_off)?;
    } else {
        kv.remove(exf, i)?;
        t.set_pnum(kv.nslots() as u8);
        if i == 0 {
            let fk = kv.key(exf, 0)?;
            t.set_fence(&fk);
        }
        sblk_store(exf, t_off, &t)?;
    }
    Ok(())
}

/// Offset of the first data node, 0 when the database is empty.
pub(crate) fn first_node(root: &Sblk) -> u64 {
    root.next_at(0)
}

/// Offset of the last data node, 0 when the database is empty.
pub(crate) fn last_node(exf: &ExFile, root_off: u64, root: &Sblk) -> Result<u64> {
    let mut cur_off = root_off;
    let mut cur = *root;
    for lvl in (0..MAX_LEVEL).rev() {
        loop {
            let nxt = cur.next_at(lvl);
            if nxt == 0 {
                break;
            }
            cur_off = nxt;
            cur = sblk_load(exf, nxt)?;
        }
    }
    Ok(if cur_off == root_off { 0 } else { cur_off })
}

/// Positions on the smallest record with key >= `key`.
pub(crate) fn locate_ge(
    exf: &ExFile,
    root_off: u64,
    root: &Sblk,
    key: &[u8],
) -> Result<Option<(u64, u8)>> {
    let sr = search(exf, root_off, root, key, false)?;
    match sr.node {
        None => {
            let first = root.next_at(0);
            Ok((first != 0).then_some((first, 0)))
        }
        Some(t_off) => {
            let t = sblk_load(exf, t_off)?;
            let kv = load_node_kv(exf, &t)?;
            match kv.find(exf, key)? {
                Ok(i) => Ok(Some((t_off, i as u8))),
                Err(pos) if pos < kv.nslots() => Ok(Some((t_off, pos as u8))),
                Err(_) => {
                    let nxt = t.next_at(0);
                    Ok((nxt != 0).then_some((nxt, 0)))
                }
            }
        }
    }
}

/// Positions on the record with exactly `key`, if present.
pub(crate) fn locate_eq(
    exf: &ExFile,
    root_off: u64,
    root: &Sblk,
    key: &[u8],
) -> Result<Option<(u64, u8)>> {
    let sr = search(exf, root_off, root, key, false)?;
    let Some(t_off) = sr.node else {
        return Ok(None);
    };
    let t = sblk_load(exf, t_off)?;
    let kv = load_node_kv(exf, &t)?;
    match kv.find(exf, key)? {
        Ok(i) => Ok(Some((t_off, i as u8))),
        Err(_) => Ok(None),
    }
}

/// Releases every node and payload block of a database, head included.
pub(crate) fn destroy_all(exf: &mut ExFile, meta: &mut Metablock, root_off: u64) -> Result<()> {
    let root = sblk_load(exf, root_off)?;
    let mut cur = root.next_at(0);
    while cur != 0 {
        let s = sblk_load(exf, cur)?;
        let nxt = s.next_at(0);
        if s.kvblk_off() != 0 {
            let kv = Kvblk::load(exf, s.kvblk_off(), s.kv_szpow())?;
            kv.free(meta, exf)?;
        }
        free_sblk(meta, exf, cur)?;
        cur = nxt;
    }
    free_sblk(meta, exf, root_off)
}
