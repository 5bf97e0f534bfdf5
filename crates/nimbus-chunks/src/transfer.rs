//! Content encryption and verification for uploads and downloads
//!
//! Content is AES-128-CTR under the file's content key with the counter
//! running continuously across chunks; the chained MAC is always computed
//! over plaintext. On download, bytes handed out before [`FileDecryptor::finish`]
//! are provisional: a MAC mismatch at the end rejects the whole transfer.

use std::io::{self, Read, Write};

use rayon::prelude::*;
use zeroize::Zeroize;

use nimbus_core::{CryptoError, CryptoResult, NimbusError, NimbusResult, TransferConfig};
use nimbus_crypto::{
    random_key, random_nonce, stream_cipher, stream_cipher_at, AesKey, CtrStream, FileKey,
    BLOCK_SIZE, NONCE_SIZE,
};

use crate::mac::{chunk_mac, file_iv, macs_match, ChunkMacer, CondensedMac, MacFold};
use crate::schedule::{chunk_spans, ChunkSpan};

/// Everything the node-creation request needs after an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedUpload {
    /// Content key, nonce and condensed MAC packed into the node key
    pub file_key: FileKey,
    pub meta_mac: CondensedMac,
    pub size: u64,
    pub chunks: u64,
}

/// A download whose MAC matched the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedDownload {
    pub size: u64,
    pub chunks: u64,
}

/// Upload side: MAC the plaintext, then encrypt it in place.
pub struct FileEncryptor {
    content_key: AesKey,
    nonce: [u8; NONCE_SIZE],
    ctr: CtrStream,
    macer: ChunkMacer,
}

impl FileEncryptor {
    pub fn new(content_key: AesKey, nonce: [u8; NONCE_SIZE]) -> Self {
        let ctr = CtrStream::new(&content_key, &nonce, 0);
        let macer = ChunkMacer::new(content_key.clone(), &nonce);
        Self {
            content_key,
            nonce,
            ctr,
            macer,
        }
    }

    /// Fresh random content key and nonce.
    pub fn random() -> Self {
        Self::new(random_key(), random_nonce())
    }

    pub fn update(&mut self, data: &mut [u8]) {
        self.macer.update(data);
        self.ctr.apply(data);
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = plaintext.to_vec();
        self.update(&mut out);
        out
    }

    pub fn bytes(&self) -> u64 {
        self.macer.bytes()
    }

    pub fn finish(self) -> SealedUpload {
        let summary = self.macer.finish();
        let file_key = FileKey::compose(&self.content_key, &self.nonce, &summary.condensed);
        tracing::debug!(size = summary.bytes, chunks = summary.chunks, "sealed upload");
        SealedUpload {
            file_key,
            meta_mac: summary.condensed,
            size: summary.bytes,
            chunks: summary.chunks,
        }
    }
}

/// Download side: decrypt in place, then MAC the plaintext.
pub struct FileDecryptor {
    ctr: CtrStream,
    macer: ChunkMacer,
    expected: CondensedMac,
    declared_size: u64,
}

impl FileDecryptor {
    pub fn new(file_key: &FileKey, declared_size: u64) -> Self {
        let (content_key, nonce, expected) = file_key.split();
        Self {
            ctr: CtrStream::new(&content_key, &nonce, 0),
            macer: ChunkMacer::new(file_key.mac_key(), &nonce),
            expected,
            declared_size,
        }
    }

    /// Decrypt the next piece of ciphertext in place. Receiving more than the
    /// declared size is an integrity failure; `data` is left untouched then.
    pub fn update(&mut self, data: &mut [u8]) -> CryptoResult<()> {
        let seen = self.macer.bytes();
        if seen + data.len() as u64 > self.declared_size {
            return Err(CryptoError::IntegrityCheckFailed(format!(
                "received {} bytes, node declares {}",
                seen + data.len() as u64,
                self.declared_size
            )));
        }
        self.ctr.apply(data);
        self.macer.update(data);
        Ok(())
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut out = ciphertext.to_vec();
        self.update(&mut out)?;
        Ok(out)
    }

    pub fn bytes(&self) -> u64 {
        self.macer.bytes()
    }

    /// Check size and condensed MAC. Only after this succeeds may the bytes
    /// already produced be trusted.
    pub fn finish(self) -> CryptoResult<VerifiedDownload> {
        let expected = self.expected;
        let declared_size = self.declared_size;
        let summary = self.macer.finish();
        if summary.bytes != declared_size {
            return Err(CryptoError::IntegrityCheckFailed(format!(
                "stream ended after {} of {} bytes",
                summary.bytes, declared_size
            )));
        }
        verify(&summary.condensed, &expected, summary.bytes, summary.chunks)
    }
}

fn verify(
    computed: &CondensedMac,
    expected: &CondensedMac,
    size: u64,
    chunks: u64,
) -> CryptoResult<VerifiedDownload> {
    if !macs_match(computed, expected) {
        tracing::warn!(size, chunks, "content MAC mismatch");
        return Err(CryptoError::IntegrityCheckFailed(format!(
            "condensed MAC mismatch over {chunks} chunk(s)"
        )));
    }
    tracing::debug!(size, chunks, "content MAC verified");
    Ok(VerifiedDownload { size, chunks })
}

/// Decrypt an arbitrary byte range of a file in place. A range cannot be
/// MAC-verified on its own; the output is unauthenticated.
pub fn decrypt_range(file_key: &FileKey, offset: u64, data: &mut [u8]) {
    stream_cipher_at(&file_key.content_key(), &file_key.nonce(), offset, data);
}

/// `Read` adapter that decrypts as it reads and verifies at end of stream.
///
/// A MAC or size failure surfaces as an `io::ErrorKind::InvalidData` error
/// from the read that hits end of stream, wrapping the `CryptoError`.
pub struct DecryptingReader<R> {
    inner: R,
    state: ReaderState,
}

enum ReaderState {
    Streaming(Box<FileDecryptor>),
    Verified(VerifiedDownload),
    Failed(CryptoError),
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(inner: R, file_key: &FileKey, declared_size: u64) -> Self {
        Self {
            inner,
            state: ReaderState::Streaming(Box::new(FileDecryptor::new(file_key, declared_size))),
        }
    }

    /// Set once the stream has been fully read and its MAC matched.
    pub fn verified(&self) -> Option<VerifiedDownload> {
        match &self.state {
            ReaderState::Verified(done) => Some(*done),
            _ => None,
        }
    }

    fn fail(&mut self, err: CryptoError) -> io::Error {
        self.state = ReaderState::Failed(err.clone());
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let decryptor = match &mut self.state {
            ReaderState::Streaming(decryptor) => decryptor,
            ReaderState::Verified(_) => return Ok(0),
            ReaderState::Failed(err) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, err.clone()))
            }
        };
        if buf.is_empty() {
            return Ok(0);
        }

        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Err(err) = decryptor.update(&mut buf[..n]) {
                return Err(self.fail(err));
            }
            return Ok(n);
        }

        let finished = match std::mem::replace(
            &mut self.state,
            ReaderState::Failed(CryptoError::IntegrityCheckFailed("stream already finished".into())),
        ) {
            ReaderState::Streaming(decryptor) => decryptor.finish(),
            other => {
                self.state = other;
                return Ok(0);
            }
        };
        match finished {
            Ok(done) => {
                self.state = ReaderState::Verified(done);
                Ok(0)
            }
            Err(err) => Err(self.fail(err)),
        }
    }
}

/// Decrypt `reader` into `writer`, verifying the MAC at the end.
///
/// Plaintext reaches `writer` before verification completes; on error the
/// caller must discard what was written.
pub fn decrypt_stream<R: Read, W: Write>(
    reader: R,
    mut writer: W,
    file_key: &FileKey,
    declared_size: u64,
    config: &TransferConfig,
) -> NimbusResult<VerifiedDownload> {
    let mut reader = DecryptingReader::new(reader, file_key, declared_size);
    let mut buf = vec![0u8; config.read_buffer_bytes.max(BLOCK_SIZE)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(into_nimbus(e)),
        };
        writer.write_all(&buf[..n])?;
    }
    writer.flush()?;
    buf.zeroize();
    reader.verified().ok_or_else(|| {
        NimbusError::Crypto(CryptoError::IntegrityCheckFailed(
            "stream not verified".into(),
        ))
    })
}

/// Encrypt `reader` into `writer` under a fresh key.
pub fn encrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    config: &TransferConfig,
) -> NimbusResult<SealedUpload> {
    let mut encryptor = FileEncryptor::random();
    let mut buf = vec![0u8; config.read_buffer_bytes.max(BLOCK_SIZE)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        encryptor.update(&mut buf[..n]);
        writer.write_all(&buf[..n])?;
    }
    writer.flush()?;
    Ok(encryptor.finish())
}

/// Recover a `CryptoError` that travelled through `io::Error`.
fn into_nimbus(err: io::Error) -> NimbusError {
    if let Some(crypto) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<CryptoError>())
    {
        return NimbusError::Crypto(crypto.clone());
    }
    NimbusError::Io(err)
}

/// Split a buffer into per-chunk slices following the schedule.
fn chunk_slices(buf: &mut [u8]) -> Vec<(ChunkSpan, &mut [u8])> {
    let spans: Vec<ChunkSpan> = chunk_spans(buf.len() as u64).collect();
    let mut slices = Vec::with_capacity(spans.len());
    let mut rest = buf;
    for span in spans {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(span.len as usize);
        slices.push((span, head));
        rest = tail;
    }
    slices
}

/// Decrypt and verify a fully buffered download, one chunk at a time.
pub fn decrypt_and_verify(
    file_key: &FileKey,
    declared_size: u64,
    ciphertext: &[u8],
) -> CryptoResult<Vec<u8>> {
    let mut decryptor = FileDecryptor::new(file_key, declared_size);
    let mut plaintext = ciphertext.to_vec();
    if let Err(err) = decryptor.update(&mut plaintext) {
        plaintext.zeroize();
        return Err(err);
    }
    match decryptor.finish() {
        Ok(_) => Ok(plaintext),
        Err(err) => {
            plaintext.zeroize();
            Err(err)
        }
    }
}

/// Decrypt and verify a fully buffered download on the rayon pool.
///
/// Chunk boundaries and counter offsets are known up front, so each chunk's
/// keystream and MAC are computed independently; the MAC chain is then
/// folded in chunk order.
pub fn decrypt_and_verify_parallel(
    file_key: &FileKey,
    declared_size: u64,
    ciphertext: &[u8],
) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() as u64 != declared_size {
        return Err(CryptoError::IntegrityCheckFailed(format!(
            "received {} bytes, node declares {declared_size}",
            ciphertext.len()
        )));
    }
    let (content_key, nonce, expected) = file_key.split();
    let mac_key = file_key.mac_key();
    let iv = file_iv(&nonce);

    let mut plaintext = ciphertext.to_vec();
    let macs: Vec<_> = chunk_slices(&mut plaintext)
        .into_par_iter()
        .map(|(span, chunk)| {
            stream_cipher(&content_key, &nonce, span.offset / BLOCK_SIZE as u64, chunk);
            chunk_mac(&mac_key, &iv, chunk)
        })
        .collect();

    let chunks = macs.len() as u64;
    let mut fold = MacFold::new(&mac_key);
    for mac in &macs {
        fold.push(mac);
    }
    match verify(&fold.condensed(), &expected, declared_size, chunks) {
        Ok(_) => Ok(plaintext),
        Err(err) => {
            plaintext.zeroize();
            Err(err)
        }
    }
}

/// Encrypt a fully buffered upload on the rayon pool.
pub fn encrypt_parallel(
    content_key: AesKey,
    nonce: [u8; NONCE_SIZE],
    plaintext: &[u8],
) -> (Vec<u8>, SealedUpload) {
    let iv = file_iv(&nonce);
    let mut ciphertext = plaintext.to_vec();
    let macs: Vec<_> = chunk_slices(&mut ciphertext)
        .into_par_iter()
        .map(|(span, chunk)| {
            let mac = chunk_mac(&content_key, &iv, chunk);
            stream_cipher(&content_key, &nonce, span.offset / BLOCK_SIZE as u64, chunk);
            mac
        })
        .collect();

    let chunks = macs.len() as u64;
    let mut fold = MacFold::new(&content_key);
    for mac in &macs {
        fold.push(mac);
    }
    let meta_mac = fold.condensed();
    let sealed = SealedUpload {
        file_key: FileKey::compose(&content_key, &nonce, &meta_mac),
        meta_mac,
        size: plaintext.len() as u64,
        chunks,
    };
    (ciphertext, sealed)
}

/// Verify a buffered download, choosing the parallel path for large files.
pub fn download_buffer(
    file_key: &FileKey,
    declared_size: u64,
    ciphertext: &[u8],
    config: &TransferConfig,
) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() as u64 >= config.parallel_threshold_bytes {
        decrypt_and_verify_parallel(file_key, declared_size, ciphertext)
    } else {
        decrypt_and_verify(file_key, declared_size, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn known_file_key() -> FileKey {
        FileKey::from_bytes(std::array::from_fn(|i| ((i * 37 + 5) % 256) as u8))
    }

    /// Upload `plain` with the content key and nonce of `known_file_key`.
    fn seal_known(plain: &[u8]) -> (Vec<u8>, SealedUpload) {
        let (content_key, nonce, _) = known_file_key().split();
        let mut encryptor = FileEncryptor::new(content_key, nonce);
        let ciphertext = encryptor.encrypt(plain);
        (ciphertext, encryptor.finish())
    }

    #[test]
    fn test_known_answer_upload() {
        let plain = data(300_000);
        let (ciphertext, sealed) = seal_known(&plain);

        assert_eq!(ciphertext[..16], hex("c8e269672f25b5352c5d5516faf525aa")[..]);
        assert_eq!(
            ciphertext[131_072..131_088],
            hex("96137b9fa5d4efc9787e3666809e8963")[..]
        );
        assert_eq!(sealed.meta_mac.to_vec(), hex("61620486941f6acd"));
        assert_eq!(sealed.chunks, 2);
        assert_eq!(sealed.size, 300_000);

        // The packed key keeps the content key and nonce, with the new MAC
        assert_eq!(sealed.file_key.content_key(), known_file_key().content_key());
        assert_eq!(sealed.file_key.nonce(), known_file_key().nonce());
        assert_eq!(sealed.file_key.meta_mac(), sealed.meta_mac);
    }

    #[test]
    fn test_roundtrip_multi_chunk() {
        let plain = data(2_500_000);
        let mut encryptor = FileEncryptor::random();
        let ciphertext = encryptor.encrypt(&plain);
        let sealed = encryptor.finish();

        let mut decryptor = FileDecryptor::new(&sealed.file_key, sealed.size);
        let mut recovered = Vec::new();
        for piece in ciphertext.chunks(77_777) {
            recovered.extend(decryptor.decrypt(piece).unwrap());
        }
        let verified = decryptor.finish().unwrap();

        assert_eq!(recovered, plain);
        assert_eq!(verified.size, plain.len() as u64);
        assert_eq!(verified.chunks, sealed.chunks);
    }

    #[test]
    fn test_zero_byte_file() {
        let encryptor = FileEncryptor::random();
        let sealed = encryptor.finish();
        assert_eq!(sealed.meta_mac, [0u8; 8]);
        assert_eq!(sealed.chunks, 0);

        let decryptor = FileDecryptor::new(&sealed.file_key, 0);
        assert_eq!(decryptor.finish().unwrap().chunks, 0);
        assert!(decrypt_and_verify_parallel(&sealed.file_key, 0, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_bit_flip_in_any_chunk_detected() {
        let plain = data(1_000_000);
        let (ciphertext, sealed) = seal_known(&plain);

        for position in [0usize, 131_072 + 5, 999_999] {
            let mut tampered = ciphertext.clone();
            tampered[position] ^= 0x01;

            // Streaming: same length out, failure only at the end
            let mut decryptor = FileDecryptor::new(&sealed.file_key, sealed.size);
            let out = decryptor.decrypt(&tampered).unwrap();
            assert_eq!(out.len(), plain.len());
            assert!(matches!(
                decryptor.finish(),
                Err(CryptoError::IntegrityCheckFailed(_))
            ));

            assert!(decrypt_and_verify(&sealed.file_key, sealed.size, &tampered).is_err());
            assert!(decrypt_and_verify_parallel(&sealed.file_key, sealed.size, &tampered).is_err());
        }
    }

    #[test]
    fn test_size_overrun_and_underrun() {
        let plain = data(5000);
        let (ciphertext, sealed) = seal_known(&plain);

        let mut over = FileDecryptor::new(&sealed.file_key, 4000);
        assert!(over.decrypt(&ciphertext).is_err());

        let mut under = FileDecryptor::new(&sealed.file_key, sealed.size);
        under.decrypt(&ciphertext[..4000]).unwrap();
        assert!(matches!(
            under.finish(),
            Err(CryptoError::IntegrityCheckFailed(_))
        ));

        assert!(decrypt_and_verify_parallel(&sealed.file_key, 4000, &ciphertext).is_err());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let plain = data(6_000_000);
        let (content_key, nonce, _) = known_file_key().split();

        let (par_ct, par_sealed) = encrypt_parallel(content_key, nonce, &plain);
        let (seq_ct, seq_sealed) = seal_known(&plain);
        assert_eq!(par_ct, seq_ct);
        assert_eq!(par_sealed, seq_sealed);

        let recovered =
            decrypt_and_verify_parallel(&par_sealed.file_key, par_sealed.size, &par_ct).unwrap();
        assert_eq!(recovered, plain);
    }

    #[test]
    fn test_download_buffer_paths_agree() {
        let plain = data(400_000);
        let (ciphertext, sealed) = seal_known(&plain);

        let sequential = TransferConfig {
            parallel_threshold_bytes: u64::MAX,
            ..TransferConfig::default()
        };
        let parallel = TransferConfig {
            parallel_threshold_bytes: 0,
            ..TransferConfig::default()
        };
        assert_eq!(
            download_buffer(&sealed.file_key, sealed.size, &ciphertext, &sequential).unwrap(),
            plain
        );
        assert_eq!(
            download_buffer(&sealed.file_key, sealed.size, &ciphertext, &parallel).unwrap(),
            plain
        );
    }

    #[test]
    fn test_decrypt_range() {
        let plain = data(300_000);
        let (ciphertext, sealed) = seal_known(&plain);

        let mut range = ciphertext[131_000..131_500].to_vec();
        decrypt_range(&sealed.file_key, 131_000, &mut range);
        assert_eq!(range, plain[131_000..131_500]);
    }

    #[test]
    fn test_reader_verifies_at_eof() {
        let plain = data(200_000);
        let (ciphertext, sealed) = seal_known(&plain);

        let mut reader =
            DecryptingReader::new(Cursor::new(ciphertext.clone()), &sealed.file_key, sealed.size);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, plain);
        assert!(reader.verified().is_some());

        let mut tampered = ciphertext;
        tampered[10] ^= 0x80;
        let mut reader =
            DecryptingReader::new(Cursor::new(tampered), &sealed.file_key, sealed.size);
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(reader.verified().is_none());
    }

    #[test]
    fn test_stream_helpers_roundtrip() {
        let plain = data(700_001);
        let config = TransferConfig {
            read_buffer_bytes: 10_000,
            ..TransferConfig::default()
        };

        let mut ciphertext = Vec::new();
        let sealed = encrypt_stream(Cursor::new(&plain), &mut ciphertext, &config).unwrap();
        assert_eq!(ciphertext.len(), plain.len());

        let mut recovered = Vec::new();
        let verified = decrypt_stream(
            Cursor::new(&ciphertext),
            &mut recovered,
            &sealed.file_key,
            sealed.size,
            &config,
        )
        .unwrap();
        assert_eq!(recovered, plain);
        assert_eq!(verified.chunks, sealed.chunks);

        ciphertext[500_000] ^= 4;
        let result = decrypt_stream(
            Cursor::new(&ciphertext),
            Vec::new(),
            &sealed.file_key,
            sealed.size,
            &config,
        );
        assert!(matches!(
            result,
            Err(NimbusError::Crypto(CryptoError::IntegrityCheckFailed(_)))
        ));
    }
}
