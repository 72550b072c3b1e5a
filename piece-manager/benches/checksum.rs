use std::io::Write;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::RngCore;

use piece_manager::calculate_checksum;

fn replica_file(len: usize) -> tempfile::NamedTempFile {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.as_file().sync_all().unwrap();
    file
}

fn bench_replica_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("replica_checksum");

    for len in &[1 << 10, 1 << 16, 1 << 22] {
        let file = replica_file(*len);

        group.throughput(Throughput::Bytes(*len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &file, |b, file| {
            b.iter(|| black_box(calculate_checksum(file.path()).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_replica_checksum);
criterion_main!(benches);
