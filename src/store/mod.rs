//! # Store and Database Handles
//!
//! The public surface of skipstore: opening the single backing file,
//! multiplexing up to 64 logical databases inside it, and the record
//! operations on each database.
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Store / Db / Cursor (this module) │
//! ├─────────────────────────────────────┤
//! │   Skip-list engine (skiplist)       │
//! ├───────────────┬─────────────────────┤
//! │ Metablock     │  Allocator          │
//! ├───────────────┴─────────────────────┤
//! │   Extendable file (exfile)          │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! A store owns two `parking_lot::RwLock`s - the engine lock (metablock,
//! registry, free lists) and the extendable-file lock - and every database
//! owns one more for its skip list. Lock order is strict and descending:
//!
//! 1. engine lock
//! 2. database lock
//! 3. file lock
//!
//! Mutating record operations take all three for writing (a single-writer
//! discipline across the file, since every write may touch the shared
//! free lists); reads take only the database and file read locks, so
//! lookups and scans run in parallel. Cursors hold locks only for the
//! duration of a single call.
//!
//! `NOLOCKS` is accepted for API compatibility but does not elide the
//! locks: eliding a `RwLock` behind a shared handle is unsound in Rust,
//! and uncontended acquisition costs a couple of atomic operations.
//!
//! ## Handle Lifecycle
//!
//! `Store` and `Db` are cheap `Arc` clones. A path can be open once per
//! process at a time; `close` is idempotent and `Drop` performs a
//! best-effort flush. Destroyed databases leave their stale handles
//! failing with `InvalidState` (cursors: `NotFound`).

pub(crate) mod alloc;
pub(crate) mod meta;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::debug;
use zerocopy::IntoBytes;

use crate::config::{MAX_KV_SZ, MAX_OFFSET};
use crate::cursor::{Cursor, CursorOp};
use crate::dup;
use crate::error::{Error, Result};
use crate::exfile::{ExFile, ExFileOpts, ResizePolicy, SyncFlags};
use crate::skiplist::{self, sblk::sblk_load, sblk::Sblk, PutMode};
use meta::{meta_span, Metablock, META_SZ};

bitflags! {
    /// Store open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Caller promises single-threaded use. Recorded only; locking is
        /// not elided (see the module docs).
        const NOLOCKS = 0x1;
        /// Reject every mutating call with [`Error::ReadOnly`].
        const RDONLY = 0x2;
        /// Discard existing file content at open.
        const TRUNC = 0x4;
    }
}

bitflags! {
    /// Database initialization flags. Fixed at first reference; later
    /// opens must pass the identical set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// Keys are 4-byte big-endian unsigned integers.
        const UINT32_KEYS = 0x1;
        /// Keys are 8-byte big-endian unsigned integers.
        const UINT64_KEYS = 0x2;
        /// Values are sorted arrays of u32 elements.
        const DUP_UINT32_VALS = 0x4;
        /// Values are sorted arrays of u64 elements.
        const DUP_UINT64_VALS = 0x8;
    }
}

bitflags! {
    /// Flags for [`Db::put_with`] and [`Cursor::set`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PutFlags: u32 {
        /// Fail with [`Error::KeyExists`] instead of overwriting.
        const NO_OVERWRITE = 0x1;
        /// Remove the element from the duplicate array instead of adding.
        const DUP_REMOVE = 0x2;
        /// Flush the store after the operation.
        const SYNC = 0x4;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// One store handle per path per process. The set is keyed by normalized
// paths so the same file cannot be opened twice through different
// spellings.
static OPEN_PATHS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn open_paths() -> &'static Mutex<HashSet<PathBuf>> {
    OPEN_PATHS.get_or_init(|| Mutex::new(HashSet::new()))
}

fn normalize_path(path: &Path) -> Result<PathBuf> {
    if let Ok(c) = path.canonicalize() {
        return Ok(c);
    }
    // The file may not exist yet; normalize through the parent.
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .ok_or(Error::InvalidState("invalid store path"))?;
    Ok(parent.canonicalize()?.join(name))
}

fn register_path(path: PathBuf) -> Result<()> {
    if open_paths().lock().insert(path) {
        Ok(())
    } else {
        Err(Error::InvalidState("store file is already open"))
    }
}

fn unregister_path(path: &Path) {
    open_paths().lock().remove(path);
}

fn flush_meta(meta: &Metablock, exf: &mut ExFile) -> Result<()> {
    exf.write_all(0, meta.as_bytes())
}

struct Engine {
    meta: Box<Metablock>,
    seed: u64,
    dbs: HashMap<u32, Arc<DbShared>>,
}

pub(crate) struct StoreInner {
    engine: RwLock<Engine>,
    exf: RwLock<ExFile>,
    flags: OpenFlags,
    path: PathBuf,
    closed: AtomicBool,
}

impl StoreInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(Error::InvalidState("store is closed"));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.flags.contains(OpenFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn sync_impl(&self, flags: SyncFlags) -> Result<()> {
        let mut engine_guard = self.engine.write();
        let engine = &mut *engine_guard;
        let mut exf = self.exf.write();
        let Engine { meta, dbs, .. } = engine;
        for (id, shared) in dbs.iter() {
            if let Some(idx) = meta.find_db(*id) {
                meta.slot_mut(idx)
                    .set_last_access_ms(shared.last_access_ms.load(AtomicOrdering::Relaxed));
            }
        }
        flush_meta(meta, &mut exf)?;
        exf.sync(flags)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, AtomicOrdering::AcqRel) {
            if !self.flags.contains(OpenFlags::RDONLY) {
                let engine = self.engine.get_mut();
                let exf = self.exf.get_mut();
                for (id, shared) in engine.dbs.iter() {
                    if let Some(idx) = engine.meta.find_db(*id) {
                        engine
                            .meta
                            .slot_mut(idx)
                            .set_last_access_ms(shared.last_access_ms.load(AtomicOrdering::Relaxed));
                    }
                }
                let _ = flush_meta(&engine.meta, exf);
                let _ = exf.sync(SyncFlags::empty());
            }
            unregister_path(&self.path);
        }
    }
}

struct DbState {
    root_off: u64,
    rng: SmallRng,
    head_cache: Option<Sblk>,
    dropped: bool,
}

pub(crate) struct DbShared {
    id: u32,
    flags: DbFlags,
    last_access_ms: AtomicU64,
    state: RwLock<DbState>,
}

impl DbShared {
    fn new(id: u32, flags: DbFlags, root_off: u64, seed: u64, last_access_ms: u64) -> Self {
        Self {
            id,
            flags,
            last_access_ms: AtomicU64::new(last_access_ms),
            state: RwLock::new(DbState {
                root_off,
                rng: SmallRng::seed_from_u64(seed),
                head_cache: None,
                dropped: false,
            }),
        }
    }

    fn touch(&self) {
        self.last_access_ms
            .store(now_ms(), AtomicOrdering::Relaxed);
    }
}

/// Builder for [`Store::open`]-style configuration.
pub struct StoreBuilder {
    path: Option<PathBuf>,
    random_seed: Option<u64>,
    flags: OpenFlags,
    initial_size: u64,
    maxoff: u64,
    policy: Option<Box<dyn ResizePolicy>>,
}

impl StoreBuilder {
    fn new() -> Self {
        Self {
            path: None,
            random_seed: None,
            flags: OpenFlags::empty(),
            initial_size: 0,
            maxoff: 0,
            policy: None,
        }
    }

    /// Path of the backing file.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Seed for the skip-list level coin. Databases created under a fixed
    /// seed draw identical level sequences, which keeps on-disk layouts
    /// reproducible in tests. Time-seeded when unset.
    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Grow the file to at least this size at open.
    pub fn initial_size(mut self, size: u64) -> Self {
        self.initial_size = size;
        self
    }

    /// Maximum file offset; clamped to the 255 GiB format limit.
    pub fn maxoff(mut self, maxoff: u64) -> Self {
        self.maxoff = maxoff;
        self
    }

    /// Custom file growth policy.
    pub fn resize_policy(mut self, policy: impl ResizePolicy + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    pub fn open(self) -> Result<Store> {
        let StoreBuilder {
            path,
            random_seed,
            flags,
            initial_size,
            maxoff,
            policy,
        } = self;
        let path = path.ok_or(Error::InvalidState("store path is required"))?;
        let rdonly = flags.contains(OpenFlags::RDONLY);
        let maxoff = if maxoff == 0 {
            MAX_OFFSET
        } else {
            maxoff.min(MAX_OFFSET)
        };

        let norm = normalize_path(&path)?;
        register_path(norm.clone())?;

        let opened: Result<StoreInner> = (|| {
            let mut exf = ExFile::open(
                &path,
                ExFileOpts {
                    initial_size: 0,
                    maxoff,
                    writable: !rdonly,
                    truncate: flags.contains(OpenFlags::TRUNC) && !rdonly,
                    policy,
                },
            )?;
            exf.add_mmap(0, maxoff)?;

            let meta = if exf.size() == 0 {
                if rdonly {
                    return Err(Error::corrupted("empty store file"));
                }
                let span = meta_span(exf.page_size());
                let m = Metablock::new(exf.page_size() as u32, span);
                exf.ensure_size(span.max(initial_size))?;
                exf.write_all(0, m.as_bytes())?;
                m
            } else {
                let mut buf = vec![0u8; META_SZ];
                exf.read_exact(0, &mut buf)?;
                let m = Metablock::from_bytes(&buf)?;
                if !rdonly && initial_size > exf.size() {
                    exf.ensure_size(initial_size)?;
                }
                m
            };

            let span = meta_span(meta.page_size() as u64);
            if meta.alloc_end() < span || meta.alloc_end() > exf.size() {
                return Err(Error::corrupted("allocation watermark out of bounds"));
            }
            alloc::validate_free_lists(&meta, &exf, span)?;

            let seed = random_seed.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0)
            });

            Ok(StoreInner {
                engine: RwLock::new(Engine {
                    meta: Box::new(meta),
                    seed,
                    dbs: HashMap::new(),
                }),
                exf: RwLock::new(exf),
                flags,
                path: norm.clone(),
                closed: AtomicBool::new(false),
            })
        })();

        match opened {
            Ok(inner) => {
                debug!(path = %inner.path.display(), "store opened");
                Ok(Store {
                    inner: Arc::new(inner),
                })
            }
            Err(e) => {
                unregister_path(&norm);
                Err(e)
            }
        }
    }
}

/// Handle to one open store file.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Opens (or creates) a store with default options.
    pub fn open(path: impl Into<PathBuf>) -> Result<Store> {
        Self::builder().path(path).open()
    }

    /// Returns the database identified by `dbid`, creating it on first
    /// reference. `flags` must match the creation flags exactly on every
    /// subsequent call.
    pub fn db(&self, dbid: u32, flags: DbFlags) -> Result<Db> {
        self.inner.ensure_open()?;
        if dbid == 0 {
            return Err(Error::InvalidState("database id must be non-zero"));
        }
        if flags.contains(DbFlags::UINT32_KEYS | DbFlags::UINT64_KEYS)
            || flags.contains(DbFlags::DUP_UINT32_VALS | DbFlags::DUP_UINT64_VALS)
        {
            return Err(Error::IncompatibleDbMode);
        }

        let mut engine_guard = self.inner.engine.write();
        let engine = &mut *engine_guard;

        if let Some(shared) = engine.dbs.get(&dbid) {
            if shared.flags != flags {
                return Err(Error::IncompatibleDbMode);
            }
            return Ok(Db {
                store: self.inner.clone(),
                shared: shared.clone(),
            });
        }

        let shared = if let Some(idx) = engine.meta.find_db(dbid) {
            let slot = engine.meta.slot(idx);
            let stored = DbFlags::from_bits(slot.flags())
                .ok_or_else(|| Error::corrupted("unknown database flags in registry"))?;
            if stored != flags {
                return Err(Error::IncompatibleDbMode);
            }
            Arc::new(DbShared::new(
                dbid,
                flags,
                slot.root_off(),
                slot.seed(),
                slot.last_access_ms(),
            ))
        } else {
            self.inner.ensure_writable()?;
            let idx = engine
                .meta
                .free_slot_index()
                .ok_or(Error::InvalidState("database registry is full"))?;
            let mut exf = self.inner.exf.write();
            let root_off = skiplist::create_head(&mut exf, &mut engine.meta, dbid)?;
            let seed = engine.seed ^ (dbid as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let slot = engine.meta.slot_mut(idx);
            slot.set_dbid(dbid);
            slot.set_flags(flags.bits());
            slot.set_root_off(root_off);
            slot.set_seed(seed);
            slot.set_last_access_ms(0);
            if dbid > engine.meta.maxdbid() {
                engine.meta.set_maxdbid(dbid);
            }
            flush_meta(&engine.meta, &mut exf)?;
            debug!(dbid, "database created");
            Arc::new(DbShared::new(dbid, flags, root_off, seed, 0))
        };

        engine.dbs.insert(dbid, shared.clone());
        Ok(Db {
            store: self.inner.clone(),
            shared,
        })
    }

    /// Flushes mappings and syncs the backing file. All writes completed
    /// before this call are durable on successful return.
    pub fn sync(&self, flags: SyncFlags) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.ensure_writable()?;
        self.inner.sync_impl(flags)
    }

    /// Closes the store. Idempotent; subsequent operations on this or any
    /// derived handle fail with `InvalidState`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        let res = if self.inner.flags.contains(OpenFlags::RDONLY) {
            Ok(())
        } else {
            self.inner.sync_impl(SyncFlags::empty())
        };
        unregister_path(&self.inner.path);
        debug!(path = %self.inner.path.display(), "store closed");
        res
    }

    /// Current size of the backing file.
    pub fn file_size(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        Ok(self.inner.exf.read().size())
    }
}

/// Handle to one logical database inside a store.
#[derive(Clone)]
pub struct Db {
    store: Arc<StoreInner>,
    shared: Arc<DbShared>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("id", &self.id()).finish()
    }
}

impl Db {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn flags(&self) -> DbFlags {
        self.shared.flags
    }

    pub(crate) fn dup_width(&self) -> Option<usize> {
        if self.shared.flags.contains(DbFlags::DUP_UINT32_VALS) {
            Some(4)
        } else if self.shared.flags.contains(DbFlags::DUP_UINT64_VALS) {
            Some(8)
        } else {
            None
        }
    }

    pub(crate) fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidState("empty keys are not supported"));
        }
        if self.shared.flags.contains(DbFlags::UINT32_KEYS) && key.len() != 4 {
            return Err(Error::KeyNumValueSize);
        }
        if self.shared.flags.contains(DbFlags::UINT64_KEYS) && key.len() != 8 {
            return Err(Error::KeyNumValueSize);
        }
        Ok(())
    }

    /// Stores a record (or one duplicate-array element).
    pub fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.put_with(key, val, PutFlags::empty())
    }

    /// Stores a record with explicit flags.
    pub fn put_with(&self, key: &[u8], val: &[u8], flags: PutFlags) -> Result<()> {
        self.store.ensure_open()?;
        self.store.ensure_writable()?;
        self.validate_key(key)?;

        let mode = match self.dup_width() {
            Some(width) => {
                if flags.contains(PutFlags::DUP_REMOVE) {
                    PutMode::DupRemove { width }
                } else {
                    PutMode::DupAdd { width }
                }
            }
            None => {
                if flags.contains(PutFlags::DUP_REMOVE) {
                    return Err(Error::InvalidState(
                        "DUP_REMOVE requires a duplicate-array database",
                    ));
                }
                if key.len() as u64 + val.len() as u64 > MAX_KV_SZ {
                    return Err(Error::MaxKvSize);
                }
                PutMode::Basic {
                    no_overwrite: flags.contains(PutFlags::NO_OVERWRITE),
                }
            }
        };

        let mut engine_guard = self.store.engine.write();
        let engine = &mut *engine_guard;
        let mut st = self.shared.state.write();
        if st.dropped {
            return Err(Error::InvalidState("database is destroyed"));
        }
        let mut exf = self.store.exf.write();

        let DbState { root_off, rng, .. } = &mut *st;
        let res = skiplist::put(
            &mut exf,
            &mut engine.meta,
            *root_off,
            self.shared.id,
            rng,
            key,
            val,
            mode,
        );
        // Track the on-disk head even after a failed mutation: pointers
        // may have moved before the failure surfaced.
        st.head_cache = sblk_load(&exf, st.root_off).ok();
        res?;
        flush_meta(&engine.meta, &mut exf)?;
        if flags.contains(PutFlags::SYNC) {
            exf.sync(SyncFlags::empty())?;
        }
        drop(exf);
        drop(st);
        self.shared.touch();
        Ok(())
    }

    /// Fetches the value stored under `key`. For duplicate-array
    /// databases the packed live elements are returned.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.store.ensure_open()?;
        self.validate_key(key)?;

        let st = self.shared.state.read();
        if st.dropped {
            return Err(Error::InvalidState("database is destroyed"));
        }
        let exf = self.store.exf.read();
        let root = match st.head_cache {
            Some(h) => h,
            None => sblk_load(&exf, st.root_off)?,
        };
        let region = skiplist::get(&exf, st.root_off, &root, key)?;
        drop(exf);
        drop(st);
        self.shared.touch();

        match self.dup_width() {
            Some(width) => Ok(dup::live_slice(&region, width)?.to_vec()),
            None => Ok(region),
        }
    }

    /// Removes the record stored under `key`.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.store.ensure_open()?;
        self.store.ensure_writable()?;
        self.validate_key(key)?;

        let mut engine_guard = self.store.engine.write();
        let engine = &mut *engine_guard;
        let mut st = self.shared.state.write();
        if st.dropped {
            return Err(Error::InvalidState("database is destroyed"));
        }
        let mut exf = self.store.exf.write();

        let res = skiplist::del(&mut exf, &mut engine.meta, st.root_off, key);
        st.head_cache = sblk_load(&exf, st.root_off).ok();
        res?;
        flush_meta(&engine.meta, &mut exf)?;
        drop(exf);
        drop(st);
        self.shared.touch();
        Ok(())
    }

    /// Opens a cursor. `key` is required for `Eq` and `Ge`.
    pub fn cursor(&self, op: CursorOp, key: Option<&[u8]>) -> Result<Cursor> {
        self.store.ensure_open()?;
        Cursor::open(self.clone(), op, key)
    }

    /// Destroys the database: releases every block it owns and clears its
    /// registry slot. Stale handles fail afterwards.
    pub fn destroy(self) -> Result<()> {
        self.store.ensure_open()?;
        self.store.ensure_writable()?;

        let mut engine_guard = self.store.engine.write();
        let engine = &mut *engine_guard;
        let mut st = self.shared.state.write();
        if st.dropped {
            return Err(Error::InvalidState("database is destroyed"));
        }
        let mut exf = self.store.exf.write();

        skiplist::destroy_all(&mut exf, &mut engine.meta, st.root_off)?;
        if let Some(idx) = engine.meta.find_db(self.shared.id) {
            engine.meta.slot_mut(idx).clear();
        }
        flush_meta(&engine.meta, &mut exf)?;
        drop(exf);
        st.dropped = true;
        st.head_cache = None;
        engine.dbs.remove(&self.shared.id);
        debug!(dbid = self.shared.id, "database destroyed");
        Ok(())
    }

    /// Drops the database's in-memory cache (the cached head node) until
    /// the next mutating access repopulates it.
    pub fn cache_release(&self) -> Result<()> {
        self.store.ensure_open()?;
        let mut st = self.shared.state.write();
        if st.dropped {
            return Err(Error::InvalidState("database is destroyed"));
        }
        st.head_cache = None;
        Ok(())
    }

    /// Last get/put/cursor access time, in milliseconds since the epoch.
    /// Zero when the database has not been used yet.
    pub fn last_access_time(&self) -> u64 {
        self.shared.last_access_ms.load(AtomicOrdering::Relaxed)
    }

    /// Runs `f` under the database and file read locks with the current
    /// skip-list head. Cursor accessors build on this so a mapped view can
    /// never outlive the locks.
    pub(crate) fn read_view<R>(
        &self,
        f: impl FnOnce(&ExFile, u64, &Sblk) -> Result<R>,
    ) -> Result<R> {
        self.store.ensure_open()?;
        let st = self.shared.state.read();
        if st.dropped {
            return Err(Error::NotFound);
        }
        let exf = self.store.exf.read();
        let root = match st.head_cache {
            Some(h) => h,
            None => sblk_load(&exf, st.root_off)?,
        };
        let res = f(&exf, st.root_off, &root);
        drop(exf);
        drop(st);
        if res.is_ok() {
            self.shared.touch();
        }
        res
    }
}
