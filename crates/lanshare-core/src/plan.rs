//! Chunk planning.
//!
//! A file is split into fixed-size chunks, each sent over its own
//! connection. Files under the 64 MiB base threshold go as a single chunk;
//! larger files aim for `min(2 x cores, 16)` chunks, with the chunk size
//! floored at the base threshold and capped at 256 MiB. Very large files
//! can therefore still produce more chunks than the target.

use std::num::NonZeroUsize;

use crate::{BASE_CHUNK_SIZE, MAX_CHUNKS, MAX_CHUNK_SIZE};

/// One chunk's place in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Chunk index in `[0, total)`
    pub index: u32,
    /// Byte offset of the chunk start
    pub offset: u64,
    /// Chunk length in bytes; only the last chunk may be short
    pub length: u64,
}

/// The full partition of a file into chunks.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    /// Chunk size used for every chunk except possibly the last
    pub chunk_size: u64,
    /// The chunks, in index order
    pub chunks: Vec<ChunkSpec>,
}

impl ChunkPlan {
    /// Number of chunks in the plan.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }
}

/// Parallelism target for chunk sizing: twice the core count, at most
/// [`MAX_CHUNKS`].
#[must_use]
pub fn target_chunks() -> u64 {
    let cores = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1) as u64;
    (cores * 2).min(u64::from(MAX_CHUNKS))
}

/// Plan the chunk partition for a file of `file_size` bytes.
///
/// The size must be positive; callers validate that before planning. The
/// resulting chunks tile the file exactly: contiguous, non-overlapping,
/// summing to `file_size`.
#[must_use]
pub fn plan_chunks(file_size: u64, base_chunk_size: u64, max_chunk_size: u64) -> ChunkPlan {
    let target = target_chunks();

    let floor = base_chunk_size.max(1);
    let cap = max_chunk_size.max(floor);
    let chunk_size = (file_size / target).max(floor).min(cap);

    let total = file_size.div_ceil(chunk_size).max(1);
    let mut chunks = Vec::with_capacity(usize::try_from(total).unwrap_or(0));
    for index in 0..total {
        let offset = index * chunk_size;
        let length = chunk_size.min(file_size - offset);
        #[allow(clippy::cast_possible_truncation)]
        chunks.push(ChunkSpec {
            index: index as u32,
            offset,
            length,
        });
    }

    ChunkPlan { chunk_size, chunks }
}

/// Plan with the default base and cap.
#[must_use]
pub fn plan_chunks_default(file_size: u64) -> ChunkPlan {
    plan_chunks(file_size, BASE_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(plan: &ChunkPlan, file_size: u64) {
        let mut expected_offset = 0;
        for (i, chunk) in plan.chunks.iter().enumerate() {
            assert_eq!(chunk.index as usize, i);
            assert_eq!(chunk.offset, expected_offset, "chunks must be contiguous");
            assert!(chunk.length > 0, "no empty chunks");
            expected_offset += chunk.length;
        }
        assert_eq!(expected_offset, file_size, "chunks must cover the file");
    }

    #[test]
    fn small_file_is_one_chunk() {
        let plan = plan_chunks_default(1);
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].length, 1);
        assert_tiles(&plan, 1);
    }

    #[test]
    fn exact_multiple_has_no_short_tail() {
        let size = BASE_CHUNK_SIZE * 3;
        let plan = plan_chunks(size, BASE_CHUNK_SIZE, MAX_CHUNK_SIZE);
        assert_tiles(&plan, size);
        assert!(plan.chunks.iter().all(|c| c.length == plan.chunk_size));
    }

    #[test]
    fn one_byte_over_adds_single_byte_chunk() {
        let size = BASE_CHUNK_SIZE + 1;
        let plan = plan_chunks(size, BASE_CHUNK_SIZE, MAX_CHUNK_SIZE);
        assert_tiles(&plan, size);
        let last = plan.chunks.last().expect("non-empty plan");
        assert_eq!(last.length, 1);
    }

    #[test]
    fn chunk_size_caps_at_maximum() {
        // Large enough that the doubling loop hits the cap.
        let size = MAX_CHUNK_SIZE * u64::from(MAX_CHUNKS) * 4;
        let plan = plan_chunks(size, BASE_CHUNK_SIZE, MAX_CHUNK_SIZE);
        assert_eq!(plan.chunk_size, MAX_CHUNK_SIZE);
        assert_tiles(&plan, size);
        assert!(plan.chunks.len() > MAX_CHUNKS as usize);
    }

    #[test]
    fn scaled_down_sizes_still_tile() {
        // Tiny chunk sizes, as integration tests configure them.
        for size in [1u64, 15, 16, 17, 64, 1000] {
            let plan = plan_chunks(size, 16, 64);
            assert_tiles(&plan, size);
        }
    }
}
