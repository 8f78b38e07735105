//! # skipstore Configuration Constants
//!
//! This module centralizes the layout and limit constants, grouping
//! interdependent values together. Constants that depend on each other are
//! co-located and pinned with compile-time assertions to prevent mismatch
//! bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! SBLK_SZ (256 bytes)
//!       │
//!       └─> the Sblk on-disk struct must be exactly this size
//!           (asserted in skiplist::sblk)
//!
//! KVBLK_MAX (63 directory slots)
//!       │
//!       ├─> KVBLK_DIR_SZ  = KVBLK_MAX * KVBLK_DIR_ENT_SZ
//!       │
//!       └─> KVBLK_PAYLOAD_OFF = KVBLK_HDR_SZ + KVBLK_DIR_SZ
//!             Payload packing starts here in every block; the minimum
//!             size class must leave room past it.
//!
//! KVBLK_MIN_SZPOW (2^11) .. KVBLK_MAX_SZPOW (2^29)
//!       │
//!       ├─> KVBLK_CLASSES = MAX - MIN + 1 free-list heads in the metablock
//!       │
//!       └─> MAX_KV_SZ must fit into the largest class together with the
//!           directory (2^29 >= KVBLK_PAYLOAD_OFF + MAX_KV_SZ)
//!
//! MAX_OFFSET (0x3fff_ffff_c0, 255 GiB)
//!       │
//!       └─> default `maxoff` for the extendable file; growth past it
//!           reports Error::MaxOffset
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `KVBLK_PAYLOAD_OFF == KVBLK_HDR_SZ + KVBLK_DIR_SZ`
//! 2. `(1 << KVBLK_MIN_SZPOW) > KVBLK_PAYLOAD_OFF` (smallest class holds data)
//! 3. `(1 << KVBLK_MAX_SZPOW) >= KVBLK_PAYLOAD_OFF + MAX_KV_SZ + 1`
//!    (a maximal record fits into the largest class)
//! 4. `KVBLK_CLASSES == KVBLK_MAX_SZPOW - KVBLK_MIN_SZPOW + 1`

// ============================================================================
// SKIP-LIST NODE (SBLK) LAYOUT
// ============================================================================

/// Size of one skip-list node block in bytes.
/// Every node, including the per-database head sentinel, occupies exactly
/// one such block.
pub const SBLK_SZ: usize = 256;

/// Maximum skip-list level. Node levels are drawn from a geometric
/// distribution truncated to `1..=MAX_LEVEL`.
pub const MAX_LEVEL: usize = 24;

/// Number of first-key bytes cached inline on a node for fence comparisons.
/// Longer keys are compared against this prefix first and read from the
/// payload block only when the prefix cannot decide.
pub const SBLK_FENCE_MAX: usize = 35;

// ============================================================================
// KEY-VALUE PAYLOAD BLOCK (KVBLK) LAYOUT
// These constants are tightly coupled - changing one requires re-checking
// the compile-time assertions below.
// ============================================================================

/// Maximum number of records packed into a single payload block.
pub const KVBLK_MAX: usize = 63;

/// Size of the payload block header in bytes.
pub const KVBLK_HDR_SZ: usize = 12;

/// Size of one directory entry: (key_off, key_len, val_off, val_len), u32 each.
pub const KVBLK_DIR_ENT_SZ: usize = 16;

/// Size of the full directory region.
pub const KVBLK_DIR_SZ: usize = KVBLK_MAX * KVBLK_DIR_ENT_SZ;

/// Offset of the first payload byte within a block.
pub const KVBLK_PAYLOAD_OFF: usize = KVBLK_HDR_SZ + KVBLK_DIR_SZ;

/// Smallest payload block size class, as a power of two (2 KiB).
pub const KVBLK_MIN_SZPOW: u8 = 11;

/// Largest payload block size class, as a power of two (512 MiB).
/// One class above the record cap so that a maximal record still fits
/// next to the directory.
pub const KVBLK_MAX_SZPOW: u8 = 29;

/// Number of payload block size classes, and of per-class free lists.
pub const KVBLK_CLASSES: usize = (KVBLK_MAX_SZPOW - KVBLK_MIN_SZPOW + 1) as usize;

/// Payload fragmentation threshold divisor: a block is compacted when hole
/// bytes exceed `block_size / KVBLK_COMPACT_DIV`.
pub const KVBLK_COMPACT_DIV: u64 = 4;

// ============================================================================
// RECORD AND FILE LIMITS
// ============================================================================

/// Maximum combined key + value size of a single record (256 MiB - 1).
pub const MAX_KV_SZ: u64 = 0x0FFF_FFFF;

/// Maximum addressable file offset (255 GiB). Growth beyond this limit
/// reports `Error::MaxOffset`.
pub const MAX_OFFSET: u64 = 0x003f_ffff_ffc0;

const _: () = assert!(
    KVBLK_PAYLOAD_OFF == KVBLK_HDR_SZ + KVBLK_DIR_SZ,
    "KVBLK_PAYLOAD_OFF derivation mismatch"
);

const _: () = assert!(
    (1usize << KVBLK_MIN_SZPOW) > KVBLK_PAYLOAD_OFF,
    "smallest KVBLK class cannot hold its own directory"
);

const _: () = assert!(
    (1u64 << KVBLK_MAX_SZPOW) >= KVBLK_PAYLOAD_OFF as u64 + MAX_KV_SZ + 1,
    "largest KVBLK class cannot hold a maximal record"
);

const _: () = assert!(
    KVBLK_CLASSES == (KVBLK_MAX_SZPOW - KVBLK_MIN_SZPOW) as usize + 1,
    "KVBLK_CLASSES derivation mismatch"
);

// ============================================================================
// METABLOCK / REGISTRY
// ============================================================================

/// On-disk store header magic.
pub const STORE_MAGIC: &[u8; 8] = b"SKIPSTR\0";

/// Current on-disk format version.
pub const STORE_VERSION: u8 = 1;

/// Number of database registry slots in the metablock. One store
/// multiplexes at most this many logical databases.
pub const MAX_DATABASES: usize = 64;

// ============================================================================
// DUPLICATE-ARRAY VALUES
// ============================================================================

/// Initial element capacity reserved for a freshly created duplicate array.
/// Capacity then grows by powers of two.
pub const DUP_INITIAL_CAP: usize = 4;
