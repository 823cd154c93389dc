use std::collections::HashSet;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::{MAX_PART_COUNT, TransferError};
use crate::types::{ChunkDescriptor, CompletedPart};

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Number of parts needed to cover `total_size` bytes.
pub fn chunk_count(total_size: u64, part_size: u64) -> Result<u64, TransferError> {
    if part_size == 0 {
        return Err(TransferError::InvalidPartSize);
    }
    Ok(total_size.div_ceil(part_size))
}

/// Splits `total_size` bytes into consecutive parts of `part_size` bytes.
///
/// Part numbers start at 1. Every part but the last is exactly `part_size`
/// long; the last one holds the remainder. A zero-length payload yields no
/// parts. Plans of more than [`MAX_PART_COUNT`] parts are rejected.
pub fn plan(total_size: u64, part_size: u64) -> Result<Vec<ChunkDescriptor>, TransferError> {
    let count = chunk_count(total_size, part_size)?;
    if count > MAX_PART_COUNT {
        return Err(TransferError::TooManyParts { parts: count });
    }
    let mut chunks = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = i * part_size;
        let end = total_size.min(start.saturating_add(part_size));
        chunks.push(ChunkDescriptor {
            part_number: (i + 1) as u32,
            start,
            end,
        });
    }
    Ok(chunks)
}

/// Returns the chunks of `chunks` that have no entry in `completed`.
pub fn pending_chunks(chunks: &[ChunkDescriptor], completed: &[CompletedPart]) -> Vec<ChunkDescriptor> {
    let done: HashSet<u32> = completed.iter().map(|p| p.part_number).collect();
    chunks
        .iter()
        .filter(|c| !done.contains(&c.part_number))
        .copied()
        .collect()
}

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes MD5 of `data` and returns the hex-encoded digest.
///
/// Object stores report this as the ETag of a single part.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn assert_covers(chunks: &[ChunkDescriptor], total: u64) {
        let mut expected_start = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.part_number as usize, i + 1);
            assert_eq!(c.start, expected_start, "gap or overlap before part {}", c.part_number);
            assert!(c.end > c.start);
            expected_start = c.end;
        }
        assert_eq!(expected_start, total);
    }

    #[test]
    fn plan_twelve_mib_in_five_mib_parts() {
        let chunks = plan(12 * MIB, 5 * MIB).unwrap();
        let lens: Vec<u64> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![5 * MIB, 5 * MIB, 2 * MIB]);
        assert_covers(&chunks, 12 * MIB);
    }

    #[test]
    fn plan_exact_multiple_has_full_last_part() {
        let chunks = plan(10, 5).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 5);
    }

    #[test]
    fn plan_empty_payload() {
        assert!(plan(0, 5).unwrap().is_empty());
    }

    #[test]
    fn plan_smaller_than_one_part() {
        let chunks = plan(3, 5).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3);
    }

    #[test]
    fn plan_rejects_zero_part_size() {
        assert!(matches!(plan(10, 0), Err(TransferError::InvalidPartSize)));
        assert!(matches!(chunk_count(10, 0), Err(TransferError::InvalidPartSize)));
    }

    #[test]
    fn plan_properties_hold_across_sizes() {
        for total in 0..200u64 {
            for part_size in 1..20u64 {
                let chunks = plan(total, part_size).unwrap();
                assert_eq!(chunks.len() as u64, total.div_ceil(part_size));
                assert_covers(&chunks, total);
                if let Some(last) = chunks.last() {
                    let rem = total % part_size;
                    let expected = if rem == 0 { part_size } else { rem };
                    assert_eq!(last.len(), expected);
                }
            }
        }
    }

    #[test]
    fn plan_near_u64_max_does_not_overflow() {
        let chunks = plan(u64::MAX, 1 << 63).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].end, 1 << 63);
        assert_eq!(chunks[1].end, u64::MAX);
        assert_covers(&chunks, u64::MAX);
    }

    #[test]
    fn plan_rejects_too_many_parts() {
        assert!(matches!(
            plan(u64::MAX, 1),
            Err(TransferError::TooManyParts { parts: u64::MAX })
        ));
        assert!(matches!(
            plan(MAX_PART_COUNT + 1, 1),
            Err(TransferError::TooManyParts { .. })
        ));
        assert_eq!(plan(MAX_PART_COUNT, 1).unwrap().len() as u64, MAX_PART_COUNT);
    }

    #[test]
    fn plan_is_deterministic() {
        assert_eq!(plan(1_000_003, 4096).unwrap(), plan(1_000_003, 4096).unwrap());
    }

    #[test]
    fn pending_excludes_completed_parts() {
        let chunks = plan(25, 5).unwrap();
        let completed = vec![
            CompletedPart {
                part_number: 2,
                etag: "b".into(),
            },
            CompletedPart {
                part_number: 4,
                etag: "d".into(),
            },
        ];
        let pending: Vec<u32> = pending_chunks(&chunks, &completed)
            .iter()
            .map(|c| c.part_number)
            .collect();
        assert_eq!(pending, vec![1, 3, 5]);
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
    }

    #[test]
    fn md5_known_vector() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }
}
