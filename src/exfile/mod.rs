//! # Extendable File
//!
//! This module implements [`ExFile`], a paged, optionally memory-mapped
//! file abstraction. It is the only component that touches the backing
//! file: everything above it (metablock, allocator, skip list) addresses
//! plain byte offsets and lets `ExFile` decide whether a range is served
//! from a mapping or from positional I/O.
//!
//! ## Hybrid I/O
//!
//! A set of registered mmap windows ("slots") covers parts of the file.
//! Slots are kept sorted by offset and pairwise non-overlapping. Every
//! read or write walks the slot list in offset order:
//!
//! ```text
//! range:      [..........................................)
//! slots:           [ slot A )          [ slot B )
//! served:     file | memcpy  |  file   | memcpy  |  file
//! ```
//!
//! Gaps before, between and after mapped slots are served by positional
//! file I/O (`read_exact_at` / `write_all_at`, which loop until the range
//! is drained); bytes inside a mapping are copied directly. Writes never
//! go through to the file for mapped bytes: the OS flushes mappings on
//! [`ExFile::sync`].
//!
//! ## Growth Protocol
//!
//! Writes past the current logical size consult the [`ResizePolicy`] via
//! [`ExFile::ensure_size`], clamp the result to the maximum offset,
//! `ftruncate` the file and remap every slot. On a truncation failure the
//! old size is restored and the slots are re-mapped best-effort.
//!
//! The logical file size is always a multiple of the system page size;
//! pre-existing unaligned files are rounded up at open.
//!
//! ## Thread Safety
//!
//! `ExFile` is `Send` but deliberately not internally locked. Read-only
//! operations take `&self`, size- or slot-changing operations take
//! `&mut self`; the owning store wraps it in a `parking_lot::RwLock`, so
//! the read/write-lock discipline maps one-to-one onto the borrow modes
//! and a mapped slice can never outlive the lock guard it was obtained
//! under.

mod policy;
mod slot;

pub use policy::{FiboPolicy, MulPolicy, PageAlignPolicy, ResizePolicy};

pub(crate) use policy::{round_down, round_up};

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use bitflags::bitflags;

use crate::error::{Error, Result};
use slot::MmapSlot;

bitflags! {
    /// Flags controlling [`ExFile::sync`] behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncFlags: u32 {
        /// Sync file data only (`fdatasync`) instead of data + metadata.
        const FDATASYNC = 0b01;
        /// Flush mappings synchronously (`MS_SYNC`) instead of scheduling
        /// an asynchronous writeback.
        const SYNC_MMAP = 0b10;
    }
}

/// Returns the system memory page size in bytes.
pub(crate) fn sys_page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps <= 0 {
        4096
    } else {
        ps as u64
    }
}

/// Options for [`ExFile::open`].
pub struct ExFileOpts {
    /// Grow the file to at least this size at open (page rounded).
    pub initial_size: u64,
    /// Maximum allowed file offset; 0 means unlimited. Rounded down to a
    /// page. Growth past it reports [`Error::MaxOffset`].
    pub maxoff: u64,
    /// Open the file for writing. When false every mutating call reports
    /// [`Error::ReadOnly`] and mappings are read-only views.
    pub writable: bool,
    /// Discard existing file contents at open.
    pub truncate: bool,
    /// Growth policy; defaults to [`PageAlignPolicy`].
    pub policy: Option<Box<dyn ResizePolicy>>,
}

impl Default for ExFileOpts {
    fn default() -> Self {
        Self {
            initial_size: 0,
            maxoff: 0,
            writable: true,
            truncate: false,
            policy: None,
        }
    }
}

/// Extendable, partially memory-mapped file.
pub struct ExFile {
    file: File,
    fsize: u64,
    psize: u64,
    maxoff: u64,
    writable: bool,
    policy: Box<dyn ResizePolicy>,
    slots: Vec<MmapSlot>,
    truncations: u64,
}

impl std::fmt::Debug for ExFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExFile")
            .field("fsize", &self.fsize)
            .field("psize", &self.psize)
            .field("maxoff", &self.maxoff)
            .field("writable", &self.writable)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl ExFile {
    pub fn open<P: AsRef<Path>>(path: P, opts: ExFileOpts) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(opts.writable)
            .create(opts.writable)
            .open(path)?;
        if opts.truncate && opts.writable {
            file.set_len(0)?;
        }

        let fsize = file.metadata()?.len();
        let psize = sys_page_size();
        let maxoff = if opts.maxoff >= psize {
            round_down(opts.maxoff, psize)
        } else {
            0
        };

        let mut exf = Self {
            file,
            fsize,
            psize,
            maxoff,
            writable: opts.writable,
            policy: opts
                .policy
                .unwrap_or_else(|| Box::new(PageAlignPolicy)),
            slots: Vec::new(),
            truncations: 0,
        };

        if exf.writable {
            if exf.fsize < opts.initial_size {
                exf.truncate_impl(opts.initial_size)?;
            } else if exf.fsize % exf.psize != 0 {
                // Repair a file left with an unaligned size.
                exf.truncate_impl(exf.fsize)?;
            }
        }
        Ok(exf)
    }

    /// Current logical file size.
    #[inline]
    pub fn size(&self) -> u64 {
        self.fsize
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        self.psize
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of size changes applied so far. Growth tests use this to
    /// observe how often the resize policy actually truncated the file.
    #[inline]
    pub fn truncate_count(&self) -> u64 {
        self.truncations
    }

    /// Reads up to `buf.len()` bytes at `off`, clamped to the logical file
    /// size. Returns the number of bytes read.
    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = off
            .checked_add(buf.len() as u64)
            .ok_or(Error::OutOfBounds)?;
        if off >= self.fsize {
            return Ok(0);
        }
        let total = (end.min(self.fsize) - off) as usize;

        let mut done = 0usize;
        let mut pos = off;
        for s in &self.slots {
            if done >= total {
                break;
            }
            let slen = s.len();
            let Some(mapped) = s.as_slice() else { continue };
            if pos + (total - done) as u64 <= s.off() {
                // Remaining range ends before this slot; slots are sorted,
                // the tail is pure file I/O.
                break;
            }
            if s.off() > pos {
                let gap = ((total - done) as u64).min(s.off() - pos) as usize;
                self.file.read_exact_at(&mut buf[done..done + gap], pos)?;
                done += gap;
                pos += gap as u64;
            }
            let send = s.off() + slen;
            if done < total && s.off() <= pos && send > pos {
                let n = ((total - done) as u64).min(send - pos) as usize;
                let start = (pos - s.off()) as usize;
                buf[done..done + n].copy_from_slice(&mapped[start..start + n]);
                done += n;
                pos += n as u64;
            }
        }
        if done < total {
            self.file.read_exact_at(&mut buf[done..total], pos)?;
        }
        Ok(total)
    }

    /// Reads exactly `buf.len()` bytes at `off`. A short read means the
    /// caller followed a dangling on-disk reference.
    pub fn read_exact(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read(off, buf)?;
        if n != buf.len() {
            return Err(Error::corrupted(format!(
                "short read at offset {off}: {n} < {}",
                buf.len()
            )));
        }
        Ok(())
    }

    /// Writes `data` at `off`, growing the file through the resize policy
    /// when the range extends past the current size. Returns the number of
    /// bytes written (always `data.len()` on success).
    pub fn write(&mut self, off: u64, data: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = off
            .checked_add(data.len() as u64)
            .ok_or(Error::OutOfBounds)?;
        if self.maxoff != 0 && end > self.maxoff {
            return Err(Error::MaxOffset);
        }
        if end > self.fsize {
            self.ensure_size(end)?;
        }

        let total = data.len();
        let mut done = 0usize;
        let mut pos = off;
        let file = &self.file;
        for s in self.slots.iter_mut() {
            if done >= total {
                break;
            }
            let slen = s.len();
            let soff = s.off();
            let Some(mapped) = s.as_mut_slice() else { continue };
            if pos + (total - done) as u64 <= soff {
                break;
            }
            if soff > pos {
                let gap = ((total - done) as u64).min(soff - pos) as usize;
                file.write_all_at(&data[done..done + gap], pos)?;
                done += gap;
                pos += gap as u64;
            }
            let send = soff + slen;
            if done < total && soff <= pos && send > pos {
                let n = ((total - done) as u64).min(send - pos) as usize;
                let start = (pos - soff) as usize;
                mapped[start..start + n].copy_from_slice(&data[done..done + n]);
                done += n;
                pos += n as u64;
            }
        }
        if done < total {
            file.write_all_at(&data[done..], pos)?;
        }
        Ok(total)
    }

    /// Writes all of `data` at `off`.
    pub fn write_all(&mut self, off: u64, data: &[u8]) -> Result<()> {
        self.write(off, data)?;
        Ok(())
    }

    /// Grows the file to at least `sz` using the resize policy. A no-op
    /// when the file is already large enough.
    pub fn ensure_size(&mut self, sz: u64) -> Result<()> {
        if self.fsize >= sz {
            return Ok(());
        }
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let nsz = self.policy.compute(sz, self.fsize, self.psize);
        if nsz < sz || nsz % self.psize != 0 {
            return Err(Error::ResizePolicyFail);
        }
        let nsz = if self.maxoff != 0 && nsz > self.maxoff {
            if self.maxoff < sz {
                return Err(Error::MaxOffset);
            }
            // maxoff is page-rounded at open, so the clamp keeps alignment.
            self.maxoff
        } else {
            nsz
        };
        self.truncate_impl(nsz)
    }

    /// Sets the logical file size (page rounded up) and re-initialises
    /// every mmap slot.
    pub fn truncate(&mut self, sz: u64) -> Result<()> {
        self.truncate_impl(sz)
    }

    fn truncate_impl(&mut self, sz: u64) -> Result<()> {
        let size = round_up(sz, self.psize);
        let old = self.fsize;
        if size == old {
            return Ok(());
        }
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if size > old {
            if self.maxoff != 0 && size > self.maxoff {
                return Err(Error::MaxOffset);
            }
            // Grow: extend the file first so the wider mappings have
            // backing pages, then remap.
            self.fsize = size;
            if let Err(e) = self.file.set_len(size) {
                return self.restore_after_truncate_failure(old, e.into());
            }
            if let Err(e) = self.remap_all() {
                return self.restore_after_truncate_failure(old, e);
            }
        } else {
            // Shrink: retire mappings past the new end before the file
            // loses those pages.
            self.fsize = size;
            if let Err(e) = self.remap_all() {
                return self.restore_after_truncate_failure(old, e);
            }
            if let Err(e) = self.file.set_len(size) {
                return self.restore_after_truncate_failure(old, e.into());
            }
        }
        self.truncations += 1;
        Ok(())
    }

    fn restore_after_truncate_failure(&mut self, old_size: u64, err: Error) -> Result<()> {
        self.fsize = old_size;
        // Best effort: keep the mappings usable at the restored size.
        let _ = self.remap_all();
        Err(err)
    }

    fn remap_all(&mut self) -> Result<()> {
        let file = &self.file;
        let fsize = self.fsize;
        let writable = self.writable;
        for s in self.slots.iter_mut() {
            s.remap(file, fsize, writable)?;
        }
        Ok(())
    }

    /// Registers an mmap window at `off` spanning up to `maxlen` bytes.
    ///
    /// `off` must be page-aligned; `maxlen` is rounded up to pages and
    /// clamped against offset overflow. The window must not overlap any
    /// registered slot.
    pub fn add_mmap(&mut self, off: u64, maxlen: u64) -> Result<()> {
        if off % self.psize != 0 {
            return Err(Error::NotAligned);
        }
        let mut maxlen = maxlen.min(u64::MAX - off);
        maxlen = match maxlen.checked_next_multiple_of(self.psize) {
            Some(r) if r <= u64::MAX - off => r,
            _ => round_down(maxlen, self.psize),
        };
        if maxlen == 0 {
            return Err(Error::OutOfBounds);
        }

        let new_end = off + maxlen;
        for s in &self.slots {
            if off < s.max_end() && s.off() < new_end {
                return Err(Error::MmapOverlap);
            }
        }

        let mut slot = MmapSlot::new(off, maxlen);
        slot.remap(&self.file, self.fsize, self.writable)?;
        let idx = self.slots.partition_point(|s| s.off() < off);
        self.slots.insert(idx, slot);
        Ok(())
    }

    /// Unregisters (and unmaps) the window starting exactly at `off`.
    pub fn remove_mmap(&mut self, off: u64) -> Result<()> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.off() == off)
            .ok_or(Error::NotMmaped)?;
        self.slots.remove(idx);
        Ok(())
    }

    /// Returns the mapped bytes of the window starting exactly at `off`.
    ///
    /// The slice borrows `self`, so under the store's lock layering it
    /// remains valid for exactly as long as the caller holds the lock
    /// guard it went through.
    pub fn mmap_slice(&self, off: u64) -> Result<&[u8]> {
        self.slots
            .iter()
            .find(|s| s.off() == off)
            .and_then(|s| s.as_slice())
            .ok_or(Error::NotMmaped)
    }

    /// Mutable variant of [`ExFile::mmap_slice`].
    pub fn mmap_slice_mut(&mut self, off: u64) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.slots
            .iter_mut()
            .find(|s| s.off() == off)
            .and_then(|s| s.as_mut_slice())
            .ok_or(Error::NotMmaped)
    }

    /// Flushes every mapping and syncs the backing file.
    pub fn sync(&self, flags: SyncFlags) -> Result<()> {
        let synchronous = flags.contains(SyncFlags::SYNC_MMAP);
        for s in &self.slots {
            s.flush(synchronous)?;
        }
        if flags.contains(SyncFlags::FDATASYNC) {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Flushes the single mapping starting at `off`.
    pub fn sync_mmap(&self, off: u64, flags: SyncFlags) -> Result<()> {
        let s = self
            .slots
            .iter()
            .find(|s| s.off() == off)
            .ok_or(Error::NotMmaped)?;
        if s.len() == 0 {
            return Err(Error::NotMmaped);
        }
        s.flush(flags.contains(SyncFlags::SYNC_MMAP))
    }
}
