//! WAL benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use tsdb_wal::config::{WalLevel, WalSettings};
use tsdb_wal::record::MsgType;
use tsdb_wal::wal::WalInstance;

fn settings(level: WalLevel) -> WalSettings {
    WalSettings {
        level,
        ..WalSettings::default()
    }
}

fn create_test_wal(level: WalLevel) -> (TempDir, WalInstance) {
    let dir = TempDir::new().unwrap();
    let wal = WalInstance::open(1, dir.path(), &settings(level)).unwrap();
    let noop = |_ctx: &mut (), _h: &tsdb_wal::record::Header, _p: &[u8], _s: tsdb_wal::restore::Source| Ok(());
    wal.restore(&noop, &mut ()).unwrap();
    (dir, wal)
}

fn bench_wal_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");

    for (name, level) in [("no_fsync", WalLevel::WriteOnly), ("fsync", WalLevel::Fsync)] {
        let (_dir, wal) = create_test_wal(level);
        let payload = Bytes::from(vec![b'x'; 100]);

        let mut version = 0u64;
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("small_payload", name), &level, |b, _| {
            b.iter(|| {
                version += 1;
                black_box(wal.write(MsgType::CREATE_TABLE, version, payload.clone()).unwrap());
            });
        });
    }

    let (_dir, wal) = create_test_wal(WalLevel::WriteOnly);
    let mut version = 0u64;
    for size in [100, 1000, 10000] {
        let payload = Bytes::from(vec![b'x'; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("payload_bytes", size), &payload, |b, payload| {
            b.iter(|| {
                version += 1;
                black_box(wal.write(MsgType::CREATE_TABLE, version, payload.clone()).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_wal_append_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append_batch");

    let (_dir, wal) = create_test_wal(WalLevel::WriteOnly);
    let payload = Bytes::from(vec![b'x'; 100]);
    let mut version = 0u64;

    for batch_size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &size| {
            b.iter(|| {
                for _ in 0..size {
                    version += 1;
                    black_box(wal.write(MsgType::CREATE_TABLE, version, payload.clone()).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_wal_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_recovery");

    for record_count in [100u64, 1000, 10000] {
        let dir = TempDir::new().unwrap();
        let noop = |_ctx: &mut (), _h: &tsdb_wal::record::Header, _p: &[u8], _s: tsdb_wal::restore::Source| Ok(());
        {
            let wal = WalInstance::open(1, dir.path(), &settings(WalLevel::WriteOnly)).unwrap();
            wal.restore(&noop, &mut ()).unwrap();
            let payload = Bytes::from(vec![b'x'; 100]);
            for version in 1..=record_count {
                wal.write(MsgType::CREATE_TABLE, version, payload.clone()).unwrap();
            }
        }

        group.throughput(Throughput::Elements(record_count));
        group.bench_with_input(BenchmarkId::from_parameter(record_count), &record_count, |b, _| {
            b.iter(|| {
                let report = tsdb_wal::restore::restore(dir.path(), 0, 0, 0, &noop, &mut ()).unwrap();
                black_box(report)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_wal_append, bench_wal_append_batch, bench_wal_recovery);
criterion_main!(benches);
