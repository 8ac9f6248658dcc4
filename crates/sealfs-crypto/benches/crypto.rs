use sealfs_crypto::{block_iv, block_tag, encrypt_block, DirContext, FileKey, NameCipher};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 4096, 65536])]
fn bench_encrypt_block(bencher: divan::Bencher, size: usize) {
    let file_key = FileKey::from_bytes([0xABu8; 32]);
    let iv = block_iv(&file_key, 0);
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt_block(divan::black_box(&file_key), &iv, divan::black_box(&data)));
}

#[divan::bench(args = [1024, 4096, 65536])]
fn bench_block_tag(bencher: divan::Bencher, size: usize) {
    let mac_key = [0x11u8; 32];
    let iv = [0u8; 24];
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| block_tag(divan::black_box(&mac_key), &iv, divan::black_box(&data)));
}

#[divan::bench]
fn bench_encode_name(bencher: divan::Bencher) {
    let names = NameCipher::new(&[0x55u8; 32]).unwrap();
    let ctx = DirContext::random();
    bencher.bench(|| names.encode(divan::black_box("quarterly-report-final.pdf"), &ctx).unwrap());
}

fn main() {
    divan::main();
}
