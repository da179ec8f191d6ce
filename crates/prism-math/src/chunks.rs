// ─────────────────────────────────────────────────────────────────────
// SCPN PRISM Core — Chunking
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Contiguous index ranges for chunked and divided work.

use prism_types::error::{PrismError, PrismResult};
use std::ops::Range;

/// Split `0..n` into consecutive ranges of at most `chunk` items.
pub fn generate_chunks(n: usize, chunk: usize) -> PrismResult<Vec<Range<usize>>> {
    if chunk == 0 {
        return Err(PrismError::Config("chunk size must be >= 1".to_string()));
    }
    Ok((0..n)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(n))
        .collect())
}

/// Split `0..n` into exactly `parts` ranges whose lengths differ by at most one.
/// The first `n % parts` ranges get the extra item.
pub fn subdivide_into_chunks(n: usize, parts: usize) -> PrismResult<Vec<Range<usize>>> {
    if parts == 0 || parts > n {
        return Err(PrismError::Config(format!(
            "cannot divide {n} items into {parts} parts"
        )));
    }
    let base = n / parts;
    let rem = n % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for part in 0..parts {
        let len = base + usize::from(part < rem);
        ranges.push(start..start + len);
        start += len;
    }
    Ok(ranges)
}

/// Items per chunk for a byte budget, never below one.
pub fn chunk_size_from_bytes(budget: usize, bytes_per_item: usize) -> usize {
    (budget / bytes_per_item.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_chunks_covers_range() {
        let chunks = generate_chunks(10, 4).expect("valid chunk");
        assert_eq!(chunks, vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn test_generate_chunks_empty() {
        assert!(generate_chunks(0, 3).expect("valid chunk").is_empty());
    }

    #[test]
    fn test_zero_chunk_rejected() {
        assert!(generate_chunks(5, 0).is_err());
    }

    #[test]
    fn test_subdivide_balanced() {
        let parts = subdivide_into_chunks(10, 3).expect("valid parts");
        assert_eq!(parts, vec![0..4, 4..7, 7..10]);
    }

    #[test]
    fn test_subdivide_too_many_parts() {
        assert!(subdivide_into_chunks(2, 3).is_err());
    }

    #[test]
    fn test_chunk_size_from_bytes() {
        assert_eq!(chunk_size_from_bytes(1024, 100), 10);
        assert_eq!(chunk_size_from_bytes(10, 100), 1);
    }
}
