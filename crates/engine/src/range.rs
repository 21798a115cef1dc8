//! Opaque block-range descriptor layout.
//!
//! A range is the unit the engine hands to placement and back to readers.
//! Outside this module only two facts about the byte layout are relied on:
//! the first 8 bytes are an engine-reserved prefix, and bytes 8..15 are the
//! object-name time prefix placement hashes for locality.

/// Opaque block descriptor exchanged with the storage engine.
pub type BlockRange = Vec<u8>;

/// Offset of the object-name bytes inside a range.
pub const OBJECT_NAME_OFFSET: usize = 8;
/// Length of the object-time prefix used by locality hashing.
pub const OBJECT_TIME_PREFIX_LEN: usize = 7;

/// Encode a block descriptor from its engine-local block number and the
/// 16-byte name of the object holding it.
pub fn encode(block_no: u64, object_name: &[u8; 16]) -> BlockRange {
    let mut raw = Vec::with_capacity(8 + 16);
    raw.extend_from_slice(&block_no.to_le_bytes());
    raw.extend_from_slice(object_name);
    raw
}

/// Engine-local block number of a descriptor.
pub fn block_no(range: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&range[0..8]);
    u64::from_le_bytes(buf)
}

/// The 7-byte object-time prefix placement hashes, or `None` for descriptors
/// too short to carry one (the memory-resident block).
pub fn object_time_prefix(range: &[u8]) -> Option<&[u8]> {
    if range.len() < OBJECT_NAME_OFFSET + OBJECT_TIME_PREFIX_LEN {
        return None;
    }
    Some(&range[OBJECT_NAME_OFFSET..OBJECT_NAME_OFFSET + OBJECT_TIME_PREFIX_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips() {
        let name = *b"0000042-object0z";
        let r = encode(7, &name);
        assert_eq!(block_no(&r), 7);
        assert_eq!(object_time_prefix(&r).expect("prefix"), &name[..7]);
    }

    #[test]
    fn short_descriptor_has_no_prefix() {
        assert!(object_time_prefix(&[0u8; 8]).is_none());
    }
}
