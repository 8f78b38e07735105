//! # Mmap Slots
//!
//! A slot is one contiguous memory-mapped window over a page-aligned file
//! range. The extendable file keeps its slots sorted by offset and pairwise
//! non-overlapping; each slot is mapped lazily up to
//! `min(maxlen, file_size - off)` and remapped whenever the file size
//! changes.
//!
//! ## Lifecycle
//!
//! ```text
//! register (unmapped) ──remap──> mapped [0..len)
//!        ^                          │ file shrinks below off
//!        └──────────────────────────┘ (len drops to 0, window stays
//!                                      registered and re-arms on growth)
//! ```
//!
//! ## Safety Considerations
//!
//! A mapping becomes invalid when the slot is remapped. Remapping requires
//! `&mut self` and byte access borrows `&self`/`&mut self`, so the borrow
//! checker rules out access across a remap at compile time. The `unsafe`
//! blocks below only assert the memmap2 contract: the file is owned by
//! this process and not concurrently truncated under a live mapping (the
//! extendable file orders truncation and remapping to maintain this).

use std::fs::File;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::Result;

/// Live mapping of a slot, read-write or read-only depending on how the
/// backing file was opened.
#[derive(Debug)]
enum SlotMap {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

impl SlotMap {
    fn len(&self) -> usize {
        match self {
            SlotMap::ReadWrite(m) => m.len(),
            SlotMap::ReadOnly(m) => m.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            SlotMap::ReadWrite(m) => &m[..],
            SlotMap::ReadOnly(m) => &m[..],
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            SlotMap::ReadWrite(m) => Some(&mut m[..]),
            SlotMap::ReadOnly(_) => None,
        }
    }

    fn flush(&self, synchronous: bool) -> Result<()> {
        match self {
            SlotMap::ReadWrite(m) => {
                if synchronous {
                    m.flush()?;
                } else {
                    m.flush_async()?;
                }
                Ok(())
            }
            // Nothing to write back for a read-only view.
            SlotMap::ReadOnly(_) => Ok(()),
        }
    }
}

/// One registered mmap window.
#[derive(Debug)]
pub(crate) struct MmapSlot {
    off: u64,
    maxlen: u64,
    map: Option<SlotMap>,
}

impl MmapSlot {
    /// Registers a window without mapping it. `off` and `maxlen` must
    /// already be page-aligned by the caller.
    pub(crate) fn new(off: u64, maxlen: u64) -> Self {
        Self {
            off,
            maxlen,
            map: None,
        }
    }

    #[inline]
    pub(crate) fn off(&self) -> u64 {
        self.off
    }

    #[inline]
    pub(crate) fn maxlen(&self) -> u64 {
        self.maxlen
    }

    /// Currently mapped length. Zero when the window lies past EOF.
    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.map.as_ref().map_or(0, |m| m.len() as u64)
    }

    /// End of the registered window, `off + maxlen`.
    #[inline]
    pub(crate) fn max_end(&self) -> u64 {
        self.off + self.maxlen
    }

    pub(crate) fn as_slice(&self) -> Option<&[u8]> {
        self.map.as_ref().map(|m| m.as_slice())
    }

    pub(crate) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        self.map.as_mut().and_then(|m| m.as_mut_slice())
    }

    /// Recomputes the mapping for the current logical file size.
    ///
    /// The new mapped length is `min(maxlen, fsize - off)`, zero when the
    /// window starts at or past EOF. A no-op when the length is unchanged.
    pub(crate) fn remap(&mut self, file: &File, fsize: u64, writable: bool) -> Result<()> {
        let nlen = if self.off >= fsize {
            0
        } else {
            self.maxlen.min(fsize - self.off)
        };
        if nlen == self.len() {
            return Ok(());
        }

        // Drop the old mapping first: the kernel may otherwise refuse to
        // map the same range twice and the old view must never outlive a
        // size change.
        self.map = None;
        if nlen == 0 {
            return Ok(());
        }

        let map = if writable {
            // SAFETY: mapping a file mutably is unsafe because external
            // modification of the file is undefined behavior. This is safe
            // because:
            // 1. The store holds the file open for exclusive in-process use;
            //    database files are not meant to be modified externally.
            // 2. `off` is page-aligned and `off + nlen <= fsize`, checked by
            //    the caller's slot bookkeeping.
            // 3. The mapping is dropped before any subsequent ftruncate
            //    below `off + nlen` (remap-then-truncate on shrink).
            let m = unsafe {
                MmapOptions::new()
                    .offset(self.off)
                    .len(nlen as usize)
                    .map_mut(file)?
            };
            SlotMap::ReadWrite(m)
        } else {
            // SAFETY: same reasoning as above; the read-only view adds no
            // write hazard of its own.
            let m = unsafe {
                MmapOptions::new()
                    .offset(self.off)
                    .len(nlen as usize)
                    .map(file)?
            };
            SlotMap::ReadOnly(m)
        };
        self.map = Some(map);
        Ok(())
    }

    /// Flushes the mapped range, synchronously or asynchronously.
    /// A no-op for unmapped windows.
    pub(crate) fn flush(&self, synchronous: bool) -> Result<()> {
        match &self.map {
            Some(m) => m.flush(synchronous),
            None => Ok(()),
        }
    }
}
