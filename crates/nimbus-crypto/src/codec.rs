//! AES-128 primitives used by the protocol
//!
//! - Key wrapping: independent per-block encryption (no chaining, no padding)
//! - Content: CTR, counter block = `nonce (8 bytes) || block index (u64 BE)`
//! - Integrity: CBC-MAC, trailing partial block zero-padded for the MAC only
//! - Attributes: CBC with an all-zero IV
//!
//! This is the only module that touches `aes` and `ctr` directly.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use rand::RngCore;
use zeroize::Zeroizing;

use nimbus_core::{CryptoError, CryptoResult};

use crate::keys::{AesKey, KEY_SIZE, NONCE_SIZE};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

type Ctr64 = ctr::Ctr64BE<Aes128>;

fn block_cipher(key: &AesKey) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

fn block_aligned(len: usize) -> bool {
    len > 0 && len % BLOCK_SIZE == 0
}

/// Encrypt each 16-byte block of `payload` independently under `key`.
pub fn wrap_key(key: &AesKey, payload: &[u8]) -> CryptoResult<Vec<u8>> {
    if !block_aligned(payload.len()) {
        return Err(CryptoError::KeyUnwrapFailed(format!(
            "key payload of {} bytes is not block aligned",
            payload.len()
        )));
    }
    let cipher = block_cipher(key);
    let mut out = payload.to_vec();
    for block in out.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(out)
}

/// Inverse of [`wrap_key`]. The result is zeroized when dropped.
pub fn unwrap_key(key: &AesKey, wrapped: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
    if !block_aligned(wrapped.len()) {
        return Err(CryptoError::KeyUnwrapFailed(format!(
            "wrapped key of {} bytes is not block aligned",
            wrapped.len()
        )));
    }
    let cipher = block_cipher(key);
    let mut out = Zeroizing::new(wrapped.to_vec());
    for block in out.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(out)
}

pub(crate) fn encrypt_block_with(cipher: &Aes128, block: &mut [u8; BLOCK_SIZE]) {
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

pub(crate) fn cipher_for(key_bytes: &[u8; KEY_SIZE]) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key_bytes))
}

/// Initial counter block for `nonce` at `block_index`.
pub fn counter_block(nonce: &[u8; NONCE_SIZE], block_index: u64) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[..NONCE_SIZE].copy_from_slice(nonce);
    block[NONCE_SIZE..].copy_from_slice(&block_index.to_be_bytes());
    block
}

/// A running CTR keystream. The counter continues across calls, so a file
/// can be fed through in pieces of any size.
pub struct CtrStream {
    inner: Ctr64,
}

impl CtrStream {
    /// Start the keystream at a block index.
    pub fn new(key: &AesKey, nonce: &[u8; NONCE_SIZE], start_block: u64) -> Self {
        let iv = counter_block(nonce, start_block);
        let inner = Ctr64::new(
            GenericArray::from_slice(key.as_bytes()),
            GenericArray::from_slice(&iv),
        );
        Self { inner }
    }

    /// Start the keystream at an arbitrary byte offset.
    pub fn at_offset(key: &AesKey, nonce: &[u8; NONCE_SIZE], byte_offset: u64) -> Self {
        let mut stream = Self::new(key, nonce, byte_offset / BLOCK_SIZE as u64);
        let skip = (byte_offset % BLOCK_SIZE as u64) as usize;
        if skip > 0 {
            let mut discard = [0u8; BLOCK_SIZE];
            stream.apply(&mut discard[..skip]);
        }
        stream
    }

    /// XOR the keystream into `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

/// CTR transform starting at `start_block`. Encryption and decryption are
/// the same operation.
pub fn stream_cipher(key: &AesKey, nonce: &[u8; NONCE_SIZE], start_block: u64, data: &mut [u8]) {
    CtrStream::new(key, nonce, start_block).apply(data);
}

/// CTR transform of a byte range that need not start on a block boundary.
pub fn stream_cipher_at(key: &AesKey, nonce: &[u8; NONCE_SIZE], byte_offset: u64, data: &mut [u8]) {
    CtrStream::at_offset(key, nonce, byte_offset).apply(data);
}

/// Incremental CBC-MAC.
///
/// Full blocks are folded in as soon as they are complete; a trailing
/// partial block is zero-padded in [`CbcMac::finalize`]. With no input at
/// all the result is the IV itself.
pub struct CbcMac {
    cipher: Aes128,
    state: [u8; BLOCK_SIZE],
    pending: [u8; BLOCK_SIZE],
    pending_len: usize,
}

impl CbcMac {
    pub fn new(key: &AesKey, iv: &[u8; BLOCK_SIZE]) -> Self {
        Self {
            cipher: block_cipher(key),
            state: *iv,
            pending: [0u8; BLOCK_SIZE],
            pending_len: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len == BLOCK_SIZE {
                self.absorb();
            }
        }
    }

    pub fn finalize(mut self) -> [u8; BLOCK_SIZE] {
        if self.pending_len > 0 {
            self.pending[self.pending_len..].fill(0);
            self.absorb();
        }
        self.state
    }

    fn absorb(&mut self) {
        for (s, p) in self.state.iter_mut().zip(self.pending.iter()) {
            *s ^= p;
        }
        encrypt_block_with(&self.cipher, &mut self.state);
        self.pending_len = 0;
    }
}

/// One-shot CBC-MAC of `data` seeded with `iv`.
pub fn cbc_mac(key: &AesKey, iv: &[u8; BLOCK_SIZE], data: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut mac = CbcMac::new(key, iv);
    mac.update(data);
    mac.finalize()
}

/// CBC encryption with an all-zero IV, in place. `data` must be block aligned.
pub fn cbc_encrypt_zero_iv(key: &AesKey, data: &mut [u8]) -> CryptoResult<()> {
    if !block_aligned(data.len()) {
        return Err(CryptoError::CorruptAttributes(format!(
            "{} bytes is not block aligned",
            data.len()
        )));
    }
    let cipher = block_cipher(key);
    let mut prev = [0u8; BLOCK_SIZE];
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        prev.copy_from_slice(block);
    }
    Ok(())
}

/// CBC decryption with an all-zero IV, in place. `data` must be block aligned.
pub fn cbc_decrypt_zero_iv(key: &AesKey, data: &mut [u8]) -> CryptoResult<()> {
    if !block_aligned(data.len()) {
        return Err(CryptoError::CorruptAttributes(format!(
            "{} bytes is not block aligned",
            data.len()
        )));
    }
    let cipher = block_cipher(key);
    let mut prev = [0u8; BLOCK_SIZE];
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        let mut saved = [0u8; BLOCK_SIZE];
        saved.copy_from_slice(block);
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = saved;
    }
    Ok(())
}

/// Generate a random 128-bit key.
pub fn random_key() -> AesKey {
    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    rand::thread_rng().fill_bytes(bytes.as_mut());
    AesKey::from_bytes(*bytes)
}

/// Generate a random CTR nonce.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
