use nimbus_crypto::{attrs, cbc_mac, random_key, random_nonce, stream_cipher, Attributes, LegacyKdf};
use secrecy::SecretString;

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(13) ^ (i >> 5)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_stream_cipher(bencher: divan::Bencher, size: usize) {
    let key = random_key();
    let nonce = random_nonce();
    let mut data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| {
            stream_cipher(
                divan::black_box(&key),
                divan::black_box(&nonce),
                0,
                &mut data,
            )
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_cbc_mac(bencher: divan::Bencher, size: usize) {
    let key = random_key();
    let iv = [0x5Au8; 16];
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| cbc_mac(divan::black_box(&key), &iv, divan::black_box(&data)));
}

#[divan::bench]
fn bench_attribute_roundtrip(bencher: divan::Bencher) {
    let key = random_key();
    let attributes = Attributes::new("quarterly-report-final-v3.xlsx");
    bencher.bench(|| {
        let encrypted = attrs::encrypt(divan::black_box(&key), &attributes).unwrap();
        attrs::decrypt(&key, &encrypted).unwrap()
    });
}

#[divan::bench(sample_count = 10)]
fn bench_legacy_kdf(bencher: divan::Bencher) {
    let kdf = LegacyKdf::new(0x10000, 0x4000);
    let password = SecretString::from("benchmark password");
    bencher.bench(|| kdf.password_key(divan::black_box(&password)).unwrap());
}

fn main() {
    divan::main();
}
