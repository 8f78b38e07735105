//! # File-Space Allocator
//!
//! Allocates and recycles the two block shapes the engine uses: fixed
//! 256-byte skip-list nodes and power-of-two payload blocks. Released
//! blocks go onto intrusive singly linked free lists whose heads live in
//! the metablock; allocation prefers a free-listed block of the exact
//! class and otherwise appends at the `alloc_end` watermark, growing the
//! file through the extendable file's resize policy.
//!
//! ## Free-Block Format
//!
//! The first 16 bytes of a released block are overwritten:
//!
//! ```text
//! Offset  Size  Content
//! 0       8     zeroes - invalidates the block header (an SBLK's in-use
//!               flag and a KVBLK's size class both live in these bytes)
//! 8       8     next free offset in the same list (0 = end of list)
//! ```
//!
//! Invalidating the header makes a freed block distinguishable from a live
//! one, which cursor revalidation relies on.
//!
//! ## Recovery Scan
//!
//! [`validate_free_lists`] is run at open: every chained offset must lie
//! inside `[meta_span, alloc_end)` with its whole block, and chains must
//! terminate within the number of blocks that could possibly exist. Any
//! violation reports `Corrupted` before the store is used.

use crate::config::{KVBLK_MAX_SZPOW, KVBLK_MIN_SZPOW, SBLK_SZ};
use crate::error::{Error, Result};
use crate::exfile::ExFile;

use super::meta::Metablock;

/// Offset of the next-pointer inside a freed block.
const FREE_NEXT_OFF: u64 = 8;

/// Free-list class index for a KVBLK size power.
#[inline]
pub(crate) fn kv_class(szpow: u8) -> usize {
    debug_assert!((KVBLK_MIN_SZPOW..=KVBLK_MAX_SZPOW).contains(&szpow));
    (szpow - KVBLK_MIN_SZPOW) as usize
}

/// Smallest size power whose block holds `need` bytes in total
/// (header + directory + payload). `MaxKvSize` when even the largest
/// class cannot.
pub(crate) fn szpow_for(need: u64) -> Result<u8> {
    let mut p = KVBLK_MIN_SZPOW;
    while (1u64 << p) < need {
        p += 1;
        if p > KVBLK_MAX_SZPOW {
            return Err(Error::MaxKvSize);
        }
    }
    Ok(p)
}

fn push_free(exf: &mut ExFile, off: u64, head: u64) -> Result<()> {
    let mut stub = [0u8; 16];
    stub[8..].copy_from_slice(&head.to_le_bytes());
    exf.write_all(off, &stub)
}

fn pop_next(exf: &ExFile, head: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    exf.read_exact(head + FREE_NEXT_OFF, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn bump(meta: &mut Metablock, exf: &mut ExFile, len: u64) -> Result<u64> {
    let off = meta.alloc_end();
    let end = off.checked_add(len).ok_or(Error::OutOfBounds)?;
    exf.ensure_size(end)?;
    meta.set_alloc_end(end);
    Ok(off)
}

/// Allocates one 256-byte node block.
pub(crate) fn alloc_sblk(meta: &mut Metablock, exf: &mut ExFile) -> Result<u64> {
    let head = meta.sblk_free_head();
    if head != 0 {
        let next = pop_next(exf, head)?;
        meta.set_sblk_free_head(next);
        Ok(head)
    } else {
        bump(meta, exf, SBLK_SZ as u64)
    }
}

/// Releases a node block onto the free list.
pub(crate) fn free_sblk(meta: &mut Metablock, exf: &mut ExFile, off: u64) -> Result<()> {
    push_free(exf, off, meta.sblk_free_head())?;
    meta.set_sblk_free_head(off);
    Ok(())
}

/// Allocates a payload block of the given size class.
pub(crate) fn alloc_kvblk(meta: &mut Metablock, exf: &mut ExFile, szpow: u8) -> Result<u64> {
    let class = kv_class(szpow);
    let head = meta.kv_free_head(class);
    if head != 0 {
        let next = pop_next(exf, head)?;
        meta.set_kv_free_head(class, next);
        Ok(head)
    } else {
        bump(meta, exf, 1u64 << szpow)
    }
}

/// Releases a payload block onto its class free list.
pub(crate) fn free_kvblk(
    meta: &mut Metablock,
    exf: &mut ExFile,
    off: u64,
    szpow: u8,
) -> Result<()> {
    let class = kv_class(szpow);
    push_free(exf, off, meta.kv_free_head(class))?;
    meta.set_kv_free_head(class, off);
    Ok(())
}

fn validate_chain(
    exf: &ExFile,
    mut off: u64,
    blk_len: u64,
    meta_span: u64,
    alloc_end: u64,
) -> Result<()> {
    // Upper bound on chain length: the allocated region cannot hold more
    // blocks of the smallest shape than this.
    let cap = (alloc_end.saturating_sub(meta_span) / SBLK_SZ as u64) + 1;
    let mut steps = 0u64;
    while off != 0 {
        if off < meta_span || off.checked_add(blk_len).map_or(true, |end| end > alloc_end) {
            return Err(Error::corrupted(format!(
                "free-list offset {off} outside allocated region"
            )));
        }
        steps += 1;
        if steps > cap {
            return Err(Error::corrupted("free-list chain does not terminate"));
        }
        off = pop_next(exf, off)?;
    }
    Ok(())
}

/// Open-time recovery scan over every free list.
pub(crate) fn validate_free_lists(
    meta: &Metablock,
    exf: &ExFile,
    meta_span: u64,
) -> Result<()> {
    let alloc_end = meta.alloc_end();
    validate_chain(exf, meta.sblk_free_head(), SBLK_SZ as u64, meta_span, alloc_end)?;
    for szpow in KVBLK_MIN_SZPOW..=KVBLK_MAX_SZPOW {
        let head = meta.kv_free_head(kv_class(szpow));
        validate_chain(exf, head, 1u64 << szpow, meta_span, alloc_end)?;
    }
    Ok(())
}
