//! Chained content MAC
//!
//! Every chunk gets its own CBC-MAC under the file's MAC key, seeded with the
//! file IV (`nonce || nonce`). The chunk MACs are then chained in order:
//!
//! ```text
//! acc = 0
//! for mac in chunk_macs: acc = AES(mac_key, acc XOR mac)
//! condensed = (acc[0..4] ^ acc[4..8]) || (acc[8..12] ^ acc[12..16])
//! ```
//!
//! The chain is order dependent. Chunk MACs can be computed out of order
//! once the boundaries are known, but must be folded in chunk order.

use nimbus_crypto::{cbc_mac, AesKey, CbcMac, FileKey, BLOCK_SIZE, META_MAC_SIZE, NONCE_SIZE};

use crate::schedule::nominal_chunk_size;

/// A single chunk's 128-bit MAC
pub type ChunkMac = [u8; BLOCK_SIZE];

/// The 8-byte value stored on a file node
pub type CondensedMac = [u8; META_MAC_SIZE];

/// Seed of every chunk MAC: the nonce twice.
pub fn file_iv(nonce: &[u8; NONCE_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    iv[..NONCE_SIZE].copy_from_slice(nonce);
    iv[NONCE_SIZE..].copy_from_slice(nonce);
    iv
}

/// MAC of one whole chunk of plaintext.
pub fn chunk_mac(mac_key: &AesKey, iv: &[u8; BLOCK_SIZE], plaintext: &[u8]) -> ChunkMac {
    cbc_mac(mac_key, iv, plaintext)
}

/// XOR the four 32-bit words of the accumulator pairwise into two.
pub fn condense(acc: &[u8; BLOCK_SIZE]) -> CondensedMac {
    let mut out = [0u8; META_MAC_SIZE];
    for i in 0..4 {
        out[i] = acc[i] ^ acc[i + 4];
        out[i + 4] = acc[i + 8] ^ acc[i + 12];
    }
    out
}

/// Constant-time comparison of condensed MACs.
pub fn macs_match(a: &CondensedMac, b: &CondensedMac) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// In-order fold of chunk MACs.
///
/// Folding a full block into a zero-IV CBC-MAC is exactly
/// `acc = AES(k, acc ^ mac)`, so the running state is a [`CbcMac`].
pub struct MacFold {
    chain: CbcMac,
    chunks: u64,
}

impl MacFold {
    pub fn new(mac_key: &AesKey) -> Self {
        Self {
            chain: CbcMac::new(mac_key, &[0u8; BLOCK_SIZE]),
            chunks: 0,
        }
    }

    pub fn push(&mut self, mac: &ChunkMac) {
        self.chain.update(mac);
        self.chunks += 1;
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    /// The raw 128-bit accumulator. All zero when nothing was pushed.
    pub fn accumulator(self) -> [u8; BLOCK_SIZE] {
        self.chain.finalize()
    }

    pub fn condensed(self) -> CondensedMac {
        condense(&self.accumulator())
    }
}

/// Result of MACing a whole file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacSummary {
    pub condensed: CondensedMac,
    pub chunks: u64,
    pub bytes: u64,
}

/// Streaming MAC over a file's plaintext.
///
/// Accepts pieces of any size; chunk boundaries are tracked internally from
/// the schedule. The trailing partial chunk is closed by [`ChunkMacer::finish`].
pub struct ChunkMacer {
    mac_key: AesKey,
    iv: [u8; BLOCK_SIZE],
    current: Option<CbcMac>,
    chunk_remaining: u64,
    next_index: u64,
    fold: MacFold,
    bytes: u64,
}

impl ChunkMacer {
    pub fn new(mac_key: AesKey, nonce: &[u8; NONCE_SIZE]) -> Self {
        let fold = MacFold::new(&mac_key);
        Self {
            mac_key,
            iv: file_iv(nonce),
            current: None,
            chunk_remaining: 0,
            next_index: 0,
            fold,
            bytes: 0,
        }
    }

    pub fn for_file(file_key: &FileKey) -> Self {
        Self::new(file_key.mac_key(), &file_key.nonce())
    }

    pub fn update(&mut self, mut plaintext: &[u8]) {
        while !plaintext.is_empty() {
            if self.current.is_none() {
                self.current = Some(CbcMac::new(&self.mac_key, &self.iv));
                self.chunk_remaining = nominal_chunk_size(self.next_index);
            }

            let take = self.chunk_remaining.min(plaintext.len() as u64) as usize;
            if let Some(mac) = self.current.as_mut() {
                mac.update(&plaintext[..take]);
            }
            self.chunk_remaining -= take as u64;
            self.bytes += take as u64;
            plaintext = &plaintext[take..];

            if self.chunk_remaining == 0 {
                self.close_chunk();
            }
        }
    }

    /// Bytes seen so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(mut self) -> MacSummary {
        self.close_chunk();
        let chunks = self.fold.chunks();
        MacSummary {
            condensed: self.fold.condensed(),
            chunks,
            bytes: self.bytes,
        }
    }

    fn close_chunk(&mut self) {
        if let Some(mac) = self.current.take() {
            self.fold.push(&mac.finalize());
            self.next_index += 1;
        }
    }
}
