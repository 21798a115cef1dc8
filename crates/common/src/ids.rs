//! Typed identifiers shared across compiler/runtime components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker bit distinguishing CN-generated segment ids from
/// storage-engine-internal ones.
pub const CN_SEGMENT_MARKER: u8 = 0x80;

/// 12-byte CN segment identifier backing distributed writes.
///
/// External-visible layout (row-id encoding; must round-trip byte-for-byte):
/// - bytes 0-3: 32-bit big-endian incrementing prefix whose high bit is the
///   `0x80` CN marker, so a fresh id reads `0x80 0x00 0x00 0x00`
/// - bytes 4-11: 64-bit big-endian cluster-allocated id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub [u8; 12]);

impl SegmentId {
    /// Build a segment id from a freshly allocated cluster id.
    pub fn new(cluster_id: u64) -> Self {
        let mut raw = [0u8; 12];
        raw[0] = CN_SEGMENT_MARKER;
        raw[4..12].copy_from_slice(&cluster_id.to_be_bytes());
        Self(raw)
    }

    /// The 32-bit incrementing prefix (marker bit included).
    pub fn prefix(&self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.0[0..4]);
        u32::from_be_bytes(buf)
    }

    /// The 64-bit cluster-allocated id.
    pub fn cluster_id(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[4..12]);
        u64::from_be_bytes(buf)
    }

    /// Increment the 32-bit prefix in place. Returns `false` once the prefix
    /// would reach `u32::MAX - 1`; the caller must then allocate a fresh
    /// cluster id instead. The all-ones prefix is reserved so CN row-id
    /// prefixes stay distinct from the engine's in-memory sentinel.
    pub fn increment(&mut self) -> bool {
        let prefix = self.prefix();
        if prefix >= u32::MAX - 1 {
            return false;
        }
        self.0[0..4].copy_from_slice(&(prefix + 1).to_be_bytes());
        true
    }

    /// Whether the id carries the CN marker bit.
    pub fn is_cn_generated(&self) -> bool {
        self.0[0] & CN_SEGMENT_MARKER != 0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_id_layout_round_trips() {
        let seg = SegmentId::new(0x0102_0304_0506_0708);
        assert_eq!(seg.0[0], 0x80);
        assert_eq!(&seg.0[1..4], &[0, 0, 0]);
        assert_eq!(&seg.0[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(seg.is_cn_generated());
        assert_eq!(seg.cluster_id(), 0x0102_0304_0506_0708);
        assert_eq!(seg.prefix(), 0x8000_0000);
    }

    #[test]
    fn segment_id_prefix_increments() {
        let mut seg = SegmentId::new(42);
        assert!(seg.increment());
        assert!(seg.increment());
        assert_eq!(seg.prefix(), 0x8000_0002);
        assert_eq!(seg.cluster_id(), 42);
        assert!(seg.is_cn_generated());
    }

    #[test]
    fn segment_id_prefix_rollover_requests_new_allocation() {
        let mut seg = SegmentId::new(7);
        seg.0[0..4].copy_from_slice(&(u32::MAX - 1).to_be_bytes());
        assert!(!seg.increment());
    }
}
