//! Chunk boundaries
//!
//! Nominal chunk sizes grow linearly for the first eight chunks, then stay
//! fixed:
//!
//! ```text
//! index   0     1     2     3     4     5     6     7      8..
//! size  128K  256K  384K  512K  640K  768K  896K  1024K  1024K
//! ```
//!
//! The last chunk is cut at the end of the file. Boundaries depend only on
//! the file size, so both ends of a transfer (and every worker of a parallel
//! one) compute the same spans independently.

/// Growth unit of the schedule (128 KiB)
pub const CHUNK_UNIT: u64 = 128 * 1024;

/// Number of chunks in the growing phase
pub const GROWING_CHUNKS: u64 = 8;

/// Size of every chunk after the growing phase (1 MiB)
pub const MAX_CHUNK_SIZE: u64 = CHUNK_UNIT * GROWING_CHUNKS;

/// Bytes covered by the growing phase (4.5 MiB)
const GROWING_SPAN: u64 = CHUNK_UNIT * GROWING_CHUNKS * (GROWING_CHUNKS + 1) / 2;

/// One chunk of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u64,
    /// Byte offset within the file
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Nominal size of chunk `index`, before truncation at the file end.
pub fn nominal_chunk_size(index: u64) -> u64 {
    if index < GROWING_CHUNKS {
        CHUNK_UNIT * (index + 1)
    } else {
        MAX_CHUNK_SIZE
    }
}

/// Start offset of chunk `index`.
pub fn chunk_offset(index: u64) -> u64 {
    if index <= GROWING_CHUNKS {
        CHUNK_UNIT * index * (index + 1) / 2
    } else {
        GROWING_SPAN + (index - GROWING_CHUNKS) * MAX_CHUNK_SIZE
    }
}

/// Index of the chunk containing byte `offset`.
pub fn chunk_index_at(offset: u64) -> u64 {
    if offset >= GROWING_SPAN {
        return GROWING_CHUNKS + (offset - GROWING_SPAN) / MAX_CHUNK_SIZE;
    }
    let mut index = 0;
    while chunk_offset(index + 1) <= offset {
        index += 1;
    }
    index
}

/// Lazily yields the chunks of a file of `size` bytes.
#[derive(Debug, Clone)]
pub struct ChunkSpans {
    size: u64,
    next_index: u64,
    next_offset: u64,
}

impl Iterator for ChunkSpans {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        if self.next_offset >= self.size {
            return None;
        }
        let len = nominal_chunk_size(self.next_index).min(self.size - self.next_offset);
        let span = ChunkSpan {
            index: self.next_index,
            offset: self.next_offset,
            len,
        };
        self.next_index += 1;
        self.next_offset += len;
        Some(span)
    }
}

/// The chunks of a file of `size` bytes. Empty for a zero-byte file.
pub fn chunk_spans(size: u64) -> ChunkSpans {
    ChunkSpans {
        size,
        next_index: 0,
        next_offset: 0,
    }
}

/// Number of chunks in a file of `size` bytes.
pub fn chunk_count(size: u64) -> u64 {
    if size == 0 {
        0
    } else {
        chunk_index_at(size - 1) + 1
    }
}
