//! # skipstore - Persistent Skip-List Key-Value Storage
//!
//! skipstore is an embedded, ordered key-value store backed by a single
//! file. It multiplexes up to 64 logically independent databases into one
//! file, supports ordered traversal through cursors, and offers
//! specialised database modes where keys are fixed-width big-endian
//! integers and values are sorted arrays of unsigned integers.
//!
//! ## Quick Start
//!
//! ```no_run
//! use skipstore::{DbFlags, CursorOp, Store};
//!
//! # fn main() -> skipstore::Result<()> {
//! let store = Store::open("my.skp")?;
//! let db = store.db(1, DbFlags::empty())?;
//!
//! db.put(b"aa", b"11")?;
//! db.put(b"bb", b"22")?;
//!
//! let mut cur = db.cursor(CursorOp::BeforeFirst, None)?;
//! while cur.to(CursorOp::Next).is_ok() {
//!     let (key, val) = cur.get()?;
//!     println!("{:?} = {:?}", key, val);
//! }
//! store.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Public API (Store / Db / Cursor)  │
//! ├─────────────────────────────────────┤
//! │   Skip-list engine                  │
//! │   (SBLK nodes + KVBLK payloads)     │
//! ├───────────────┬─────────────────────┤
//! │  Metablock +  │  Free-list          │
//! │  DB registry  │  allocator          │
//! ├───────────────┴─────────────────────┤
//! │   Extendable file (hybrid mmap /    │
//! │   positional I/O, resize policies)  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! One file. A metablock at offset 0 holds the magic, format version,
//! creation page size, the 64-slot database registry and the free-list
//! heads. Every database is a skip list of fixed 256-byte node blocks
//! pointing at power-of-two payload blocks that pack up to 63 records
//! each. All multi-byte integers are little-endian, except keys of
//! integer-key databases, which are big-endian so lexicographic order
//! equals numeric order.
//!
//! ## Limits
//!
//! - Maximum store file size: 255 GiB
//! - Maximum key + value size per record: 256 MiB - 1
//! - Maximum databases per store: 64
//!
//! ## Concurrency
//!
//! Synchronous blocking operations on caller threads; one writer at a
//! time per store, readers in parallel. There is no write-ahead log:
//! durability points are explicit [`Store::sync`] calls (or the `SYNC`
//! put flag).
//!
//! ## Module Overview
//!
//! - [`exfile`]: extendable file, mmap windows, resize policies
//! - `store`: metablock, registry, allocator, public handles
//! - `skiplist`: node and payload blocks, search/insert/delete
//! - `cursor`: ordered traversal with safe invalidation
//! - `dup`: sorted duplicate-integer-array values

#[macro_use]
mod macros;

pub mod config;
mod cursor;
mod dup;
mod error;
pub mod exfile;
mod skiplist;
mod store;

pub use cursor::{Cursor, CursorOp};
pub use error::{Error, Result};
pub use exfile::{FiboPolicy, MulPolicy, PageAlignPolicy, ResizePolicy, SyncFlags};
pub use store::{Db, DbFlags, OpenFlags, PutFlags, Store, StoreBuilder};
