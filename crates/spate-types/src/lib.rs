#![forbid(unsafe_code)]
//! Shared identifiers, page geometry, and configuration for spate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fixed page size in bytes. All cached I/O is sliced on this boundary.
///
/// Other page sizes are out of scope; the cache, the engine, and the KV
/// dispatcher all assume this constant.
pub const PAGE_SIZE: usize = 4096;

/// Round a byte offset down to the containing page boundary.
#[must_use]
pub const fn floor_to_page(off: u64) -> u64 {
    off & !(PAGE_SIZE as u64 - 1)
}

/// Round a byte offset up to the next page boundary.
#[must_use]
pub const fn ceil_to_page(off: u64) -> u64 {
    floor_to_page(off + PAGE_SIZE as u64 - 1)
}

/// Stable identifier of an open file within the I/O core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file{}", self.0)
    }
}

/// Byte offset within a file (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing byte offsets with page
/// indices and entry indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Whether this offset sits on a page boundary.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity of a cached page: `(file, page-aligned offset)`.
///
/// The central cache invariant is that at most one frame holds a given
/// `PageLocation` at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageLocation {
    pub file: FileId,
    pub offset: ByteOffset,
}

impl PageLocation {
    /// The location of the page containing `byte_off` (aligns down).
    #[must_use]
    pub fn containing(file: FileId, byte_off: ByteOffset) -> Self {
        Self {
            file,
            offset: ByteOffset(floor_to_page(byte_off.0)),
        }
    }

    /// The location of the page immediately after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self {
            file: self.file,
            offset: ByteOffset(self.offset.0 + PAGE_SIZE as u64),
        }
    }
}

impl fmt::Display for PageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file, self.offset)
    }
}

/// Index of a frame in the cache's fixed arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Direction of an I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoDir {
    Read,
    Write,
}

/// Replacement policy selector.
///
/// `HashIndex` selects the hash-partitioned associative engine; the config
/// surface keeps all three historical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicyKind {
    Lru2q,
    Associative,
    HashIndex,
}

/// One access produced by a workload generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEntry {
    /// Byte offset of the access.
    pub offset: u64,
    /// Access size in bytes.
    pub size: u32,
    /// `true` for a read, `false` for a write.
    pub is_read: bool,
}

/// Owned page-sized buffer whose exposed slice starts on a [`PAGE_SIZE`]
/// boundary, as direct I/O requires.
///
/// This type remains fully safe by keeping the original backing allocation
/// and exposing an aligned subslice. Length is always exactly `PAGE_SIZE`.
#[derive(Debug)]
pub struct PageBuf {
    storage: Vec<u8>,
    start: usize,
}

impl Clone for PageBuf {
    fn clone(&self) -> Self {
        // A derived clone would copy the storage to a differently aligned
        // allocation while keeping the old start.
        Self::from_bytes(self.as_slice())
    }
}

impl PageBuf {
    /// Allocate a zeroed, page-aligned buffer.
    #[must_use]
    pub fn zeroed() -> Self {
        let storage = vec![0_u8; PAGE_SIZE * 2 - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (PAGE_SIZE - 1);
        let start = if misalignment == 0 {
            0
        } else {
            PAGE_SIZE - misalignment
        };
        debug_assert!(start + PAGE_SIZE <= storage.len());
        Self { storage, start }
    }

    /// Build a page buffer holding a copy of `bytes`.
    ///
    /// `bytes.len()` must not exceed `PAGE_SIZE`; the tail is zero-filled.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::zeroed();
        buf.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + PAGE_SIZE]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        &mut self.storage[start..start + PAGE_SIZE]
    }

    /// Zero the buffer for reuse.
    pub fn reset(&mut self) {
        self.as_mut_slice().fill(0);
    }

    #[allow(clippy::len_without_is_empty)]
    #[must_use]
    pub const fn len(&self) -> usize {
        PAGE_SIZE
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl PartialEq for PageBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for PageBuf {}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Cache and engine configuration.
///
/// `cache_size` is rounded down to a multiple of [`PAGE_SIZE`];
/// `entry_size` must divide [`PAGE_SIZE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub policy: CachePolicyKind,
    /// Cache capacity in bytes.
    pub cache_size: u64,
    /// Per-engine in-flight I/O budget.
    pub max_aio: usize,
    /// Client value size in bytes.
    pub entry_size: usize,
    /// NUMA locality hint threaded to object pools. Diagnostic only.
    pub node_id: Option<u32>,
    /// Advisory backpressure bound: how long a drain loop may spin before a
    /// `Stuck` warning is raised.
    #[serde(with = "duration_ms")]
    pub stuck_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicyKind::Lru2q,
            cache_size: 64 * 1024 * 1024,
            max_aio: 128,
            entry_size: 8,
            node_id: None,
            stuck_after: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    /// Validate field constraints and round `cache_size` down to a page
    /// multiple.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.cache_size = floor_to_page(self.cache_size);
        if self.cache_size == 0 {
            return Err(ConfigError::InvalidField {
                field: "cache_size",
                reason: "must be at least one page",
            });
        }
        if self.max_aio == 0 {
            return Err(ConfigError::InvalidField {
                field: "max_aio",
                reason: "must be non-zero",
            });
        }
        if self.entry_size == 0 || PAGE_SIZE % self.entry_size != 0 {
            return Err(ConfigError::InvalidField {
                field: "entry_size",
                reason: "must be a non-zero divisor of PAGE_SIZE",
            });
        }
        Ok(self)
    }

    /// Number of page frames this configuration provides.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        (self.cache_size / PAGE_SIZE as u64) as usize
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(floor_to_page(0), 0);
        assert_eq!(floor_to_page(4095), 0);
        assert_eq!(floor_to_page(4096), 4096);
        assert_eq!(ceil_to_page(0), 0);
        assert_eq!(ceil_to_page(1), 4096);
        assert_eq!(ceil_to_page(4096), 4096);
        assert_eq!(ceil_to_page(4097), 8192);
    }

    #[test]
    fn page_location_containing_aligns_down() {
        let loc = PageLocation::containing(FileId(3), ByteOffset(10_000));
        assert_eq!(loc.offset, ByteOffset(8192));
        assert_eq!(loc.next().offset, ByteOffset(12288));
        assert!(loc.offset.is_page_aligned());
    }

    #[test]
    fn page_buf_is_aligned_and_page_sized() {
        let buf = PageBuf::zeroed();
        assert_eq!(buf.len(), PAGE_SIZE);
        assert_eq!(buf.as_slice().as_ptr() as usize % PAGE_SIZE, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn page_buf_clone_stays_aligned() {
        let buf = PageBuf::from_bytes(&[0x11; 64]);
        let cloned = buf.clone();
        assert_eq!(cloned.as_slice().as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(cloned, buf);
    }

    #[test]
    fn page_buf_from_bytes_zero_fills_tail() {
        let mut buf = PageBuf::from_bytes(&[0xAB; 100]);
        assert_eq!(&buf.as_slice()[..100], &[0xAB; 100]);
        assert!(buf.as_slice()[100..].iter().all(|&b| b == 0));
        buf.reset();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn config_rounds_cache_size_down() {
        let cfg = CacheConfig {
            cache_size: 4096 * 4 + 123,
            ..CacheConfig::default()
        }
        .validated()
        .unwrap();
        assert_eq!(cfg.cache_size, 4096 * 4);
        assert_eq!(cfg.frame_count(), 4);
    }

    #[test]
    fn config_rejects_bad_entry_size() {
        let err = CacheConfig {
            entry_size: 3,
            ..CacheConfig::default()
        }
        .validated()
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidField { field: "entry_size", .. }
        ));
    }

    #[test]
    fn config_rejects_sub_page_cache() {
        let err = CacheConfig {
            cache_size: 4095,
            ..CacheConfig::default()
        }
        .validated()
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidField { field: "cache_size", .. }
        ));
    }
}
