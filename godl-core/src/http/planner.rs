//! Phase 2 — Plan (spec §4.7).

use crate::request::{ChunkSizePolicy, MAX_AUTO_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// A single range to be fetched independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: usize,
    pub start: u64,
    pub end_inclusive: u64,
}

impl ChunkSpec {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }
}

/// An ordered, gapless, non-overlapping chunk plan covering `[0, size-1]`
/// (spec §3 "Chunk plan").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunks: Vec<ChunkSpec>,
}

impl ChunkPlan {
    #[must_use]
    pub fn single(total_size: u64) -> Self {
        Self { chunks: vec![ChunkSpec { index: 0, start: 0, end_inclusive: total_size.saturating_sub(1) }] }
    }

    #[must_use]
    pub fn covers_exactly(&self, total_size: u64) -> bool {
        let mut expected_start = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != i || chunk.start != expected_start {
                return false;
            }
            expected_start = chunk.end_inclusive + 1;
        }
        expected_start == total_size
    }
}

/// Decides whether the transfer should use chunked parallelism or fall
/// through to single-stream (spec §4.7 Phase 2, §8 boundaries).
#[must_use]
pub fn should_chunk(total_size: i64, supports_ranges: bool, concurrency: usize) -> bool {
    total_size >= 0
        && supports_ranges
        && concurrency > 1
        && (total_size as u64) >= MIN_CHUNK_SIZE
}

/// Rounds `size` up to the nearest 64 KiB boundary, per spec §4.7.
#[must_use]
fn round_up_64kib(size: u64) -> u64 {
    const ALIGN: u64 = 64 * 1024;
    ((size + ALIGN - 1) / ALIGN) * ALIGN
}

/// Resolves the effective chunk size for `total_size` bytes split across
/// `concurrency` workers, honoring an explicit override when present.
#[must_use]
pub fn resolve_chunk_size(total_size: u64, concurrency: usize, policy: ChunkSizePolicy) -> u64 {
    match policy {
        ChunkSizePolicy::Explicit(n) => n,
        ChunkSizePolicy::Auto => {
            let n = concurrency.max(1) as u64;
            let raw = total_size.div_ceil(n);
            round_up_64kib(raw).min(MAX_AUTO_CHUNK_SIZE).max(64 * 1024)
        }
    }
}

/// Builds the chunk plan for a known-size, range-capable download
/// (spec §4.7 Phase 2). The last chunk absorbs any remainder.
#[must_use]
pub fn build_plan(total_size: u64, chunk_size: u64) -> ChunkPlan {
    if total_size == 0 {
        return ChunkPlan { chunks: vec![ChunkSpec { index: 0, start: 0, end_inclusive: 0 }] };
    }
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0u64;
    let mut index = 0usize;
    while start < total_size {
        let end = (start + chunk_size - 1).min(total_size - 1);
        chunks.push(ChunkSpec { index, start, end_inclusive: end });
        start = end + 1;
        index += 1;
    }
    ChunkPlan { chunks }
}
