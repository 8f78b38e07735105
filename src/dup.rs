//! # Duplicate-Integer-Array Values
//!
//! In `DUP_UINT32_VALS` / `DUP_UINT64_VALS` databases the value stored per
//! key is a sorted, deduplicated array of fixed-width unsigned integers.
//! This module owns the array's byte format and its pure operations; the
//! engine persists the produced regions through the ordinary value-update
//! path.
//!
//! ## Region Format
//!
//! ```text
//! Offset  Size        Content
//! 0       4           count: number of live elements (u32 LE)
//! 4       count*W     elements, ascending, W = 4 or 8, little-endian
//! ...     capacity    unused reserved space (region grows by doubling)
//! ```
//!
//! The stored directory length of a dup value is the *region* size, so
//! capacity survives relocation and most additions rewrite in place
//! without growing the block.

use crate::config::DUP_INITIAL_CAP;
use crate::error::{Error, Result};

/// Decodes one caller-supplied element, enforcing the database width.
pub(crate) fn decode_elem(val: &[u8], width: usize) -> Result<u64> {
    if val.len() != width {
        return Err(Error::DupValueSize);
    }
    Ok(match width {
        4 => u32::from_le_bytes(val.try_into().unwrap()) as u64,
        8 => u64::from_le_bytes(val.try_into().unwrap()),
        _ => unreachable!("dup width is always 4 or 8"),
    })
}

/// Encodes an element into the database width. Values that do not fit the
/// narrow width are rejected.
pub(crate) fn encode_elem(v: u64, width: usize) -> Result<Vec<u8>> {
    match width {
        4 => {
            let n = u32::try_from(v).map_err(|_| Error::DupValueSize)?;
            Ok(n.to_le_bytes().to_vec())
        }
        8 => Ok(v.to_le_bytes().to_vec()),
        _ => unreachable!("dup width is always 4 or 8"),
    }
}

/// Number of live elements in a region.
pub(crate) fn count(region: &[u8]) -> Result<u32> {
    if region.len() < 4 {
        return Err(Error::corrupted("dup array region shorter than its header"));
    }
    Ok(u32::from_le_bytes(region[..4].try_into().unwrap()))
}

fn checked_count(region: &[u8], width: usize) -> Result<usize> {
    let n = count(region)? as usize;
    if region.len() < 4 + n * width {
        return Err(Error::corrupted("dup array count exceeds its region"));
    }
    Ok(n)
}

fn elem_at(region: &[u8], width: usize, i: usize) -> u64 {
    let off = 4 + i * width;
    match width {
        4 => u32::from_le_bytes(region[off..off + 4].try_into().unwrap()) as u64,
        _ => u64::from_le_bytes(region[off..off + 8].try_into().unwrap()),
    }
}

fn write_elem(buf: &mut [u8], width: usize, i: usize, v: u64) {
    let off = 4 + i * width;
    match width {
        4 => buf[off..off + 4].copy_from_slice(&(v as u32).to_le_bytes()),
        _ => buf[off..off + 8].copy_from_slice(&v.to_le_bytes()),
    }
}

/// Binary search: `Ok(index)` when present, `Err(insert_pos)` otherwise.
fn find(region: &[u8], width: usize, v: u64) -> Result<std::result::Result<usize, usize>> {
    let n = checked_count(region, width)?;
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let e = elem_at(region, width, mid);
        match e.cmp(&v) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}

fn reserve_for(count: usize, width: usize) -> usize {
    let cap = count.next_power_of_two().max(DUP_INITIAL_CAP);
    4 + cap * width
}

/// Builds a fresh single-element array. Returns the live bytes and the
/// region size to reserve.
pub(crate) fn new_array(width: usize, v: u64) -> (Vec<u8>, usize) {
    let mut bytes = vec![0u8; 4 + width];
    bytes[..4].copy_from_slice(&1u32.to_le_bytes());
    write_elem(&mut bytes, width, 0, v);
    (bytes, reserve_for(1, width))
}

/// Inserts `v` keeping sort order and uniqueness. `None` when already
/// present (no write needed); otherwise the new live bytes and the region
/// size to reserve.
pub(crate) fn add(region: &[u8], width: usize, v: u64) -> Result<Option<(Vec<u8>, usize)>> {
    let pos = match find(region, width, v)? {
        Ok(_) => return Ok(None),
        Err(pos) => pos,
    };
    let n = checked_count(region, width)?;
    let mut bytes = vec![0u8; 4 + (n + 1) * width];
    bytes[..4].copy_from_slice(&((n + 1) as u32).to_le_bytes());
    bytes[4..4 + pos * width].copy_from_slice(&region[4..4 + pos * width]);
    write_elem(&mut bytes, width, pos, v);
    bytes[4 + (pos + 1) * width..].copy_from_slice(&region[4 + pos * width..4 + n * width]);
    // Keep at least the current region so in-place growth stays possible.
    let reserve = reserve_for(n + 1, width).max(region.len());
    Ok(Some((bytes, reserve)))
}

/// Removes `v` if present. `None` when absent (removal of a missing
/// element is still success); otherwise the new live bytes, reserved at
/// the current region size.
pub(crate) fn remove(region: &[u8], width: usize, v: u64) -> Result<Option<(Vec<u8>, usize)>> {
    let pos = match find(region, width, v)? {
        Ok(pos) => pos,
        Err(_) => return Ok(None),
    };
    let n = checked_count(region, width)?;
    let mut bytes = vec![0u8; 4 + (n - 1) * width];
    bytes[..4].copy_from_slice(&((n - 1) as u32).to_le_bytes());
    bytes[4..4 + pos * width].copy_from_slice(&region[4..4 + pos * width]);
    bytes[4 + pos * width..].copy_from_slice(&region[4 + (pos + 1) * width..4 + n * width]);
    Ok(Some((bytes, region.len())))
}

/// Membership test.
pub(crate) fn contains(region: &[u8], width: usize, v: u64) -> Result<bool> {
    Ok(find(region, width, v)?.is_ok())
}

/// The live element bytes (count header stripped).
pub(crate) fn live_slice(region: &[u8], width: usize) -> Result<&[u8]> {
    let n = checked_count(region, width)?;
    Ok(&region[4..4 + n * width])
}

/// Visits elements in ascending (or descending) order, optionally starting
/// from `start` (or the closest element toward the iteration direction).
/// The visitor returns `false` to stop.
pub(crate) fn iter(
    region: &[u8],
    width: usize,
    start: Option<u64>,
    down: bool,
    visitor: &mut dyn FnMut(u64) -> bool,
) -> Result<()> {
    let n = checked_count(region, width)?;
    if n == 0 {
        return Ok(());
    }
    if down {
        let mut i = match start {
            None => n - 1,
            Some(s) => match find(region, width, s)? {
                Ok(i) => i,
                Err(0) => return Ok(()),
                Err(pos) => pos - 1,
            },
        };
        loop {
            if !visitor(elem_at(region, width, i)) {
                return Ok(());
            }
            if i == 0 {
                return Ok(());
            }
            i -= 1;
        }
    } else {
        let first = match start {
            None => 0,
            Some(s) => match find(region, width, s)? {
                Ok(i) => i,
                Err(pos) => pos,
            },
        };
        for i in first..n {
            if !visitor(elem_at(region, width, i)) {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(region: &[u8], width: usize, start: Option<u64>, down: bool) -> Vec<u64> {
        let mut out = Vec::new();
        iter(region, width, start, down, &mut |v| {
            out.push(v);
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn add_keeps_sorted_and_unique() {
        let (mut region, _) = new_array(4, 10);
        for v in [1u64, 10, 5] {
            if let Some((bytes, _)) = add(&region, 4, v).unwrap() {
                region = bytes;
            }
        }

        assert_eq!(count(&region).unwrap(), 3);
        assert_eq!(collect(&region, 4, None, false), vec![1, 5, 10]);
    }

    #[test]
    fn add_existing_is_noop() {
        let (region, _) = new_array(4, 7);

        assert!(add(&region, 4, 7).unwrap().is_none());
    }

    #[test]
    fn remove_deletes_and_tolerates_absent() {
        let (mut region, _) = new_array(8, 2);
        region = add(&region, 8, 4).unwrap().unwrap().0;
        region = add(&region, 8, 6).unwrap().unwrap().0;

        let (bytes, _) = remove(&region, 8, 4).unwrap().unwrap();
        assert_eq!(collect(&bytes, 8, None, false), vec![2, 6]);

        assert!(remove(&bytes, 8, 99).unwrap().is_none());
    }

    #[test]
    fn contains_uses_binary_search() {
        let (mut region, _) = new_array(4, 2);
        for v in [4u64, 8, 16, 32] {
            region = add(&region, 4, v).unwrap().unwrap().0;
        }

        assert!(contains(&region, 4, 16).unwrap());
        assert!(!contains(&region, 4, 15).unwrap());
    }

    #[test]
    fn reserve_doubles_with_growth() {
        let (_, r1) = new_array(4, 1);
        assert_eq!(r1, 4 + DUP_INITIAL_CAP * 4);

        let mut region = new_array(4, 1).0;
        for v in 2..=5u64 {
            region = add(&region, 4, v).unwrap().unwrap().0;
        }
        let (_, r5) = add(&region, 4, 6).unwrap().unwrap();
        assert_eq!(r5, 4 + 8 * 4);
    }

    #[test]
    fn iter_descending_and_from_start() {
        let (mut region, _) = new_array(4, 1);
        for v in [3u64, 5, 7] {
            region = add(&region, 4, v).unwrap().unwrap().0;
        }

        assert_eq!(collect(&region, 4, None, true), vec![7, 5, 3, 1]);
        assert_eq!(collect(&region, 4, Some(5), false), vec![5, 7]);
        assert_eq!(collect(&region, 4, Some(5), true), vec![5, 3, 1]);
        // Start between elements: nearest toward the direction.
        assert_eq!(collect(&region, 4, Some(4), false), vec![5, 7]);
        assert_eq!(collect(&region, 4, Some(4), true), vec![3, 1]);
        // Start below the minimum going down: nothing.
        assert_eq!(collect(&region, 4, Some(0), true), Vec::<u64>::new());
    }

    #[test]
    fn iter_stops_when_visitor_declines() {
        let (mut region, _) = new_array(4, 1);
        for v in [2u64, 3, 4] {
            region = add(&region, 4, v).unwrap().unwrap().0;
        }

        let mut seen = Vec::new();
        iter(&region, 4, None, false, &mut |v| {
            seen.push(v);
            v < 2
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn narrow_width_rejects_wide_elements() {
        let err = encode_elem(u64::from(u32::MAX) + 1, 4).unwrap_err();
        assert!(matches!(err, Error::DupValueSize));

        let err = decode_elem(b"12345", 4).unwrap_err();
        assert!(matches!(err, Error::DupValueSize));
    }

    #[test]
    fn live_slice_strips_capacity() {
        let (region, reserve) = new_array(4, 9);
        let mut padded = region.clone();
        padded.resize(reserve, 0xAA);

        let live = live_slice(&padded, 4).unwrap();
        assert_eq!(live, &9u32.to_le_bytes());
    }
}
