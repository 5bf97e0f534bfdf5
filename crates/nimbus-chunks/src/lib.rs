//! nimbus-chunks: chunk schedule, chained content MAC and transfer encryption
//!
//! # Overview
//! - `schedule`: growing-then-fixed chunk boundaries (128 KiB steps up to 1 MiB)
//! - `mac`: per-chunk CBC-MAC, in-order MAC chain, 8-byte condensed MAC
//! - `transfer`: streaming encrypt/decrypt with verification, `Read` adapter,
//!   and rayon-parallel paths for buffered files

pub mod mac;
pub mod schedule;
pub mod transfer;

pub use mac::{
    chunk_mac, condense, file_iv, ChunkMac, ChunkMacer, CondensedMac, MacFold, MacSummary,
};
pub use schedule::{
    chunk_count, chunk_index_at, chunk_offset, chunk_spans, nominal_chunk_size, ChunkSpan,
};
pub use transfer::{
    decrypt_and_verify, decrypt_and_verify_parallel, decrypt_range, decrypt_stream,
    download_buffer, encrypt_parallel, encrypt_stream, DecryptingReader, FileDecryptor,
    FileEncryptor, SealedUpload, VerifiedDownload,
};
