//! # Position Packing and Cache Keys
//!
//! Block positions are stored as a single `i64` per block:
//!
//! | bits  | field | width |
//! |-------|-------|-------|
//! | 38-63 | x     | 26    |
//! | 26-37 | y     | 12    |
//! | 0-25  | z     | 26    |
//!
//! Each field is masked, not sign-extended. Coordinates outside `0..2^26` (x, z) or
//! `0..2^12` (y), negatives included, wrap into the field and may collide with other
//! positions. The ledger only stores and compares packed values, so no unpacking is
//! provided.

use cgmath::Point3;
use std::fmt;

/// A block position packed into one integer by [`pack`].
pub type PackedPosition = i64;

const XZ_MASK: i64 = 0x3FF_FFFF;
const Y_MASK: i64 = 0xFFF;
const X_SHIFT: u32 = 38;
const Y_SHIFT: u32 = 26;

/// Chunks per side of a region. Files are still written one per chunk; the constant
/// only documents the intended grouping.
pub const REGION_SIZE: i32 = 32;

/// Packs a block coordinate into a [`PackedPosition`].
///
/// # Examples
/// ```
/// use placement_ledger::ledger::position::pack;
///
/// assert_eq!(pack(0, 0, 1), 1);
/// assert_eq!(pack(0, 1, 0), 1 << 26);
/// assert_eq!(pack(1, 0, 0), 1 << 38);
/// ```
pub const fn pack(x: i32, y: i32, z: i32) -> PackedPosition {
    ((x as i64 & XZ_MASK) << X_SHIFT) | ((y as i64 & Y_MASK) << Y_SHIFT) | (z as i64 & XZ_MASK)
}

/// Packs a `cgmath` block position.
pub fn pack_point(position: Point3<i32>) -> PackedPosition {
    pack(position.x, position.y, position.z)
}

/// Identifies the ledger of one chunk column in one world.
///
/// Displays as `<world>_<chunk x>_<chunk z>`, the form used in log messages. Lookups
/// and file paths use the fields directly, so world names may contain `_`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// World name; also the name of the world's storage directory.
    pub world: String,
    /// Chunk x coordinate.
    pub chunk_x: i32,
    /// Chunk z coordinate.
    pub chunk_z: i32,
}

impl CacheKey {
    /// Builds the key for chunk `(chunk_x, chunk_z)` of `world`.
    pub fn new(world: &str, chunk_x: i32, chunk_z: i32) -> Self {
        Self {
            world: world.to_string(),
            chunk_x,
            chunk_z,
        }
    }

    /// File name of this chunk's ledger inside its world directory.
    pub fn file_name(&self) -> String {
        format!("region_{}_{}.dat", self.chunk_x, self.chunk_z)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.world, self.chunk_x, self.chunk_z)
    }
}
