#![forbid(unsafe_code)]

/// Checksum of one store record: kind byte, little-endian node id, then payload.
pub fn record_crc32(kind: u8, id: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&id.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Returns true when `expected` matches the record's recomputed checksum.
pub fn record_matches(kind: u8, id: u64, payload: &[u8], expected: u32) -> bool {
    record_crc32(kind, id, payload) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_component_feeds_the_checksum() {
        let payload = vec![0u8; 16];
        let crc = record_crc32(1, 2, &payload);
        assert!(record_matches(1, 2, &payload, crc));

        let mut flipped = payload.clone();
        flipped[15] ^= 0x80;
        assert!(!record_matches(1, 2, &flipped, crc));
        assert!(!record_matches(2, 2, &payload, crc));
        assert!(!record_matches(1, 3, &payload, crc));
    }

    #[test]
    fn empty_tombstone_payloads_still_differ_by_id() {
        assert_ne!(record_crc32(2, 0, &[]), record_crc32(2, 1, &[]));
    }
}
