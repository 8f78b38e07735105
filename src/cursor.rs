//! # Cursors
//!
//! A cursor is a stateful position over one database's records, moving in
//! key order in either direction. Between calls a cursor holds only plain
//! offsets (no locks, no mapped memory); every accessor re-enters the
//! database under its read locks through [`Db::read_view`].
//!
//! ## State Machine
//!
//! ```text
//!              Next                 Next                 Next
//! BeforeFirst ────> At(node, slot) ────> At(..) ... ────> AfterLast
//!      ^  Prev          │  ^                                  │
//!      └────────────────┘  └──────────────────────────────────┘ Prev
//!
//! At ──(pinned record vanished)──> Invalid   (every call: NotFound)
//! ```
//!
//! Movement past either end parks the cursor at `BeforeFirst`/`AfterLast`
//! and returns [`Error::NotFound`]; scans loop `while cursor.to(Next) is
//! Ok`.
//!
//! ## Safe Invalidation
//!
//! The record a cursor points at can be deleted - and its node block
//! freed and even reused - by concurrent writes to the same database.
//! The cursor therefore remembers the key it sits on and revalidates on
//! every call: the node must be live, owned by this database, the slot in
//! range and the slot's key identical. Any mismatch turns the cursor
//! `Invalid`; it never reads another record's data and never faults.

use crate::dup;
use crate::error::{Error, Result};
use crate::exfile::ExFile;
use crate::skiplist::kvblk::Kvblk;
use crate::skiplist::sblk::{sblk_load_raw, Sblk};
use crate::skiplist::{first_node, last_node, locate_eq, locate_ge};
use crate::store::{Db, PutFlags};
use crate::config::MAX_LEVEL;

/// Cursor positioning and movement operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// Park before the first record.
    BeforeFirst,
    /// Park after the last record.
    AfterLast,
    /// Move to the next record in key order.
    Next,
    /// Move to the previous record in key order.
    Prev,
    /// Position exactly at a given key.
    Eq,
    /// Position at the smallest key greater than or equal to a given key.
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    AfterLast,
    At { sblk: u64, slot: u8 },
    Invalid,
}

/// Outcome of a movement step computed under the read locks.
enum Step {
    To { sblk: u64, slot: u8, key: Vec<u8> },
    End,
    Dead,
}

/// Stateful position over one database. See the module docs.
#[derive(Debug)]
pub struct Cursor {
    db: Db,
    pos: Position,
    cur_key: Vec<u8>,
}

/// Loads the record the cursor claims to sit on, verifying that the block
/// is still this database's live node and that the slot still carries the
/// cursor's key. `None` means the position is stale.
fn validate_at(
    exf: &ExFile,
    dbid: u32,
    off: u64,
    slot: u8,
    key: &[u8],
) -> Result<Option<(Sblk, Kvblk)>> {
    let s = sblk_load_raw(exf, off)?;
    if !s.is_used()
        || s.is_head()
        || s.dbid() != dbid
        || s.level() == 0
        || s.level() > MAX_LEVEL
        || slot >= s.pnum()
    {
        return Ok(None);
    }
    let kv = match Kvblk::load(exf, s.kvblk_off(), s.kv_szpow()) {
        Ok(kv) => kv,
        // A freed block reused under a different shape reads as corrupted
        // from this stale reference; that is staleness, not corruption.
        Err(Error::Corrupted(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    if kv.nslots() != s.pnum() as usize {
        return Ok(None);
    }
    if kv.key(exf, slot as usize)? != key {
        return Ok(None);
    }
    Ok(Some((s, kv)))
}

/// Reads the key at a known-live position (used when entering a node the
/// engine just handed out).
fn key_at(exf: &ExFile, off: u64, slot: u8) -> Result<Vec<u8>> {
    let s = sblk_load_raw(exf, off)?;
    let kv = Kvblk::load(exf, s.kvblk_off(), s.kv_szpow())?;
    kv.key(exf, slot as usize)
}

impl Cursor {
    pub(crate) fn open(db: Db, op: CursorOp, key: Option<&[u8]>) -> Result<Cursor> {
        let mut cur = Cursor {
            db,
            pos: Position::BeforeFirst,
            cur_key: Vec::new(),
        };
        match op {
            CursorOp::BeforeFirst => {}
            CursorOp::AfterLast => cur.pos = Position::AfterLast,
            CursorOp::Next => cur.next()?,
            CursorOp::Prev => {
                cur.pos = Position::AfterLast;
                cur.prev()?;
            }
            CursorOp::Eq => cur.to_eq(key.ok_or(Error::InvalidState("EQ requires a key"))?)?,
            CursorOp::Ge => cur.to_ge(key.ok_or(Error::InvalidState("GE requires a key"))?)?,
        }
        Ok(cur)
    }

    /// Repositions or moves the cursor. `Eq`/`Ge` need [`Cursor::to_key`].
    pub fn to(&mut self, op: CursorOp) -> Result<()> {
        match op {
            CursorOp::BeforeFirst => {
                self.pos = Position::BeforeFirst;
                self.cur_key.clear();
                Ok(())
            }
            CursorOp::AfterLast => {
                self.pos = Position::AfterLast;
                self.cur_key.clear();
                Ok(())
            }
            CursorOp::Next => self.next(),
            CursorOp::Prev => self.prev(),
            CursorOp::Eq | CursorOp::Ge => {
                Err(Error::InvalidState("this cursor operation requires a key"))
            }
        }
    }

    /// Repositions the cursor with a key argument.
    pub fn to_key(&mut self, op: CursorOp, key: &[u8]) -> Result<()> {
        match op {
            CursorOp::Eq => self.to_eq(key),
            CursorOp::Ge => self.to_ge(key),
            _ => self.to(op),
        }
    }

    fn to_eq(&mut self, key: &[u8]) -> Result<()> {
        self.db.validate_key(key)?;
        let found = self
            .db
            .read_view(|exf, root_off, root| locate_eq(exf, root_off, root, key))?;
        match found {
            Some((sblk, slot)) => {
                self.pos = Position::At { sblk, slot };
                self.cur_key = key.to_vec();
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn to_ge(&mut self, key: &[u8]) -> Result<()> {
        self.db.validate_key(key)?;
        let found = self.db.read_view(|exf, root_off, root| {
            match locate_ge(exf, root_off, root, key)? {
                Some((sblk, slot)) => {
                    let k = key_at(exf, sblk, slot)?;
                    Ok(Some((sblk, slot, k)))
                }
                None => Ok(None),
            }
        })?;
        match found {
            Some((sblk, slot, k)) => {
                self.pos = Position::At { sblk, slot };
                self.cur_key = k;
            }
            None => {
                self.pos = Position::AfterLast;
                self.cur_key.clear();
            }
        }
        Ok(())
    }

    fn apply_step(&mut self, step: Step, park: Position) -> Result<()> {
        match step {
            Step::To { sblk, slot, key } => {
                self.pos = Position::At { sblk, slot };
                self.cur_key = key;
                Ok(())
            }
            Step::End => {
                self.pos = park;
                self.cur_key.clear();
                Err(Error::NotFound)
            }
            Step::Dead => {
                self.pos = Position::Invalid;
                self.cur_key.clear();
                Err(Error::NotFound)
            }
        }
    }

    fn next(&mut self) -> Result<()> {
        let step = match self.pos {
            Position::Invalid => Step::Dead,
            Position::AfterLast => Step::End,
            Position::BeforeFirst => self.db.read_view(|exf, _, root| {
                let first = first_node(root);
                if first == 0 {
                    return Ok(Step::End);
                }
                let k = key_at(exf, first, 0)?;
                Ok(Step::To {
                    sblk: first,
                    slot: 0,
                    key: k,
                })
            })?,
            Position::At { sblk, slot } => {
                let dbid = self.db.id();
                let cur_key = &self.cur_key;
                self.db.read_view(|exf, _, _| {
                    let Some((s, kv)) = validate_at(exf, dbid, sblk, slot, cur_key)? else {
                        return Ok(Step::Dead);
                    };
                    let nslot = slot as usize + 1;
                    if nslot < kv.nslots() {
                        let k = kv.key(exf, nslot)?;
                        return Ok(Step::To {
                            sblk,
                            slot: nslot as u8,
                            key: k,
                        });
                    }
                    let nxt = s.next_at(0);
                    if nxt == 0 {
                        return Ok(Step::End);
                    }
                    let k = key_at(exf, nxt, 0)?;
                    Ok(Step::To {
                        sblk: nxt,
                        slot: 0,
                        key: k,
                    })
                })?
            }
        };
        self.apply_step(step, Position::AfterLast)
    }

    fn prev(&mut self) -> Result<()> {
        let step = match self.pos {
            Position::Invalid => Step::Dead,
            Position::BeforeFirst => Step::End,
            Position::AfterLast => self.db.read_view(|exf, root_off, root| {
                let last = last_node(exf, root_off, root)?;
                if last == 0 {
                    return Ok(Step::End);
                }
                let s = sblk_load_raw(exf, last)?;
                let slot = s.pnum().saturating_sub(1);
                let k = key_at(exf, last, slot)?;
                Ok(Step::To {
                    sblk: last,
                    slot,
                    key: k,
                })
            })?,
            Position::At { sblk, slot } => {
                let dbid = self.db.id();
                let cur_key = &self.cur_key;
                self.db.read_view(|exf, _, _| {
                    let Some((s, kv)) = validate_at(exf, dbid, sblk, slot, cur_key)? else {
                        return Ok(Step::Dead);
                    };
                    if slot > 0 {
                        let k = kv.key(exf, slot as usize - 1)?;
                        return Ok(Step::To {
                            sblk,
                            slot: slot - 1,
                            key: k,
                        });
                    }
                    let prev = s.prev0();
                    if prev == 0 {
                        return Ok(Step::End);
                    }
                    let p = sblk_load_raw(exf, prev)?;
                    if !p.is_used() || p.is_head() || p.dbid() != dbid || p.pnum() == 0 {
                        return Ok(Step::Dead);
                    }
                    let pslot = p.pnum() - 1;
                    let k = key_at(exf, prev, pslot)?;
                    Ok(Step::To {
                        sblk: prev,
                        slot: pslot,
                        key: k,
                    })
                })?
            }
        };
        self.apply_step(step, Position::BeforeFirst)
    }

    /// Reads the value region at the current position, invalidating the
    /// cursor when the record has vanished.
    fn value_region(&mut self) -> Result<Vec<u8>> {
        let Position::At { sblk, slot } = self.pos else {
            return Err(Error::NotFound);
        };
        let dbid = self.db.id();
        let cur_key = &self.cur_key;
        let region = self.db.read_view(|exf, _, _| {
            let Some((_, kv)) = validate_at(exf, dbid, sblk, slot, cur_key)? else {
                return Ok(None);
            };
            Ok(Some(kv.value_region(exf, slot as usize)?))
        })?;
        match region {
            Some(r) => Ok(r),
            None => {
                self.pos = Position::Invalid;
                self.cur_key.clear();
                Err(Error::NotFound)
            }
        }
    }

    fn dup_width(&self) -> Result<usize> {
        self.db.dup_width().ok_or(Error::InvalidState(
            "operation requires a duplicate-array database",
        ))
    }

    /// Key and value at the current position.
    pub fn get(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let val = self.val()?;
        Ok((self.cur_key.clone(), val))
    }

    /// Key at the current position.
    pub fn key(&mut self) -> Result<Vec<u8>> {
        let Position::At { sblk, slot } = self.pos else {
            return Err(Error::NotFound);
        };
        let dbid = self.db.id();
        let cur_key = &self.cur_key;
        let live = self
            .db
            .read_view(|exf, _, _| Ok(validate_at(exf, dbid, sblk, slot, cur_key)?.is_some()))?;
        if live {
            Ok(self.cur_key.clone())
        } else {
            self.pos = Position::Invalid;
            self.cur_key.clear();
            Err(Error::NotFound)
        }
    }

    /// Value at the current position. For duplicate-array databases the
    /// packed live elements are returned.
    pub fn val(&mut self) -> Result<Vec<u8>> {
        let region = self.value_region()?;
        match self.db.dup_width() {
            Some(width) => Ok(dup::live_slice(&region, width)?.to_vec()),
            None => Ok(region),
        }
    }

    /// Copies the key into `buf` (at most `buf.len()` bytes) and returns
    /// the full key length.
    pub fn copy_key(&mut self, buf: &mut [u8]) -> Result<usize> {
        let key = self.key()?;
        let n = key.len().min(buf.len());
        buf[..n].copy_from_slice(&key[..n]);
        Ok(key.len())
    }

    /// Copies the value into `buf` (at most `buf.len()` bytes) and returns
    /// the full value length.
    pub fn copy_val(&mut self, buf: &mut [u8]) -> Result<usize> {
        let val = self.val()?;
        let n = val.len().min(buf.len());
        buf[..n].copy_from_slice(&val[..n]);
        Ok(val.len())
    }

    /// Stores a value under the cursor's current key; equivalent to a
    /// `put` on the database.
    pub fn set(&mut self, val: &[u8], flags: PutFlags) -> Result<()> {
        let Position::At { .. } = self.pos else {
            return Err(Error::NotFound);
        };
        self.db.put_with(&self.cur_key, val, flags)
    }

    /// Number of elements in the duplicate array at the current position.
    pub fn dup_num(&mut self) -> Result<u32> {
        self.dup_width()?;
        let region = self.value_region()?;
        dup::count(&region)
    }

    /// Adds one element to the duplicate array at the current position.
    pub fn dup_add(&mut self, dv: u64) -> Result<()> {
        let width = self.dup_width()?;
        let Position::At { .. } = self.pos else {
            return Err(Error::NotFound);
        };
        let bytes = dup::encode_elem(dv, width)?;
        self.db.put_with(&self.cur_key, &bytes, PutFlags::empty())
    }

    /// Removes one element from the duplicate array at the current
    /// position. Removing an absent element is still success.
    pub fn dup_rm(&mut self, dv: u64) -> Result<()> {
        let width = self.dup_width()?;
        let Position::At { .. } = self.pos else {
            return Err(Error::NotFound);
        };
        let bytes = dup::encode_elem(dv, width)?;
        self.db
            .put_with(&self.cur_key, &bytes, PutFlags::DUP_REMOVE)
    }

    /// Membership test in the duplicate array at the current position.
    pub fn dup_contains(&mut self, dv: u64) -> Result<bool> {
        let width = self.dup_width()?;
        let region = self.value_region()?;
        dup::contains(&region, width, dv)
    }

    /// Visits duplicate-array elements in ascending (or descending) order,
    /// optionally starting from `start`. The visitor returns `false` to
    /// stop.
    pub fn dup_iter(
        &mut self,
        mut visitor: impl FnMut(u64) -> bool,
        start: Option<u64>,
        down: bool,
    ) -> Result<()> {
        let width = self.dup_width()?;
        let region = self.value_region()?;
        dup::iter(&region, width, start, down, &mut visitor)
    }

    /// Closes the cursor. Equivalent to dropping it.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}
