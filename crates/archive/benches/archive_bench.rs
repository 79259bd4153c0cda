//! Benchmarks for the archive write and read paths.
//!
//! Run with: cargo bench --package alopex-archive
//!
//! ## Benchmark Categories
//!
//! - **Record Codec**: Point record encode/decode
//! - **Compression**: Swinging-door evaluation
//! - **Archive Writes**: Full write pipeline with and without compression
//! - **Archive Reads**: Range reads across historic and active files

use alopex_archive::store::{
    InMemoryCoordinationStore, InMemoryMetadataStore, InMemoryStateStore, MetadataRecord,
};
use alopex_archive::{
    ArchiveConfig, ArchiveFile, CompressionEngine, CompressionState, PointRecord, Quality,
    TimeTag,
};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::sync::Arc;
use tempfile::TempDir;

/// Slowly varying samples one second apart.
fn generate_samples(id: i32, count: usize) -> Vec<PointRecord> {
    let mut value = 50.0f32;
    (0..count)
        .map(|i| {
            value += ((i as f32) * 0.1).sin() * 0.1;
            PointRecord::new(
                id,
                TimeTag::from_millis_saturating(1_000 + i as i64 * 1_000),
                value,
                Quality::Good,
            )
        })
        .collect()
}

fn open_archive(dir: &TempDir, compress: bool) -> ArchiveFile {
    let config = ArchiveConfig::new(dir.path().join("bench.d"))
        .with_blocks(1024, 8192)
        .with_compression(compress);
    let archive = ArchiveFile::new(
        config,
        Arc::new(InMemoryMetadataStore::with_records([
            MetadataRecord::new(1, "bench").with_compression_limit(0.05)
        ])),
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryCoordinationStore::new()),
    )
    .unwrap();
    archive.open().unwrap();
    archive
}

fn bench_record_codec(c: &mut Criterion) {
    let samples = generate_samples(1, 10_000);
    let mut group = c.benchmark_group("record_codec");
    group.throughput(Throughput::Elements(samples.len() as u64));

    group.bench_function("encode_10k", |b| {
        b.iter(|| {
            for sample in &samples {
                black_box(sample.to_bytes());
            }
        })
    });

    let encoded: Vec<_> = samples.iter().map(PointRecord::to_bytes).collect();
    group.bench_function("decode_10k", |b| {
        b.iter(|| {
            for bytes in &encoded {
                black_box(PointRecord::decode(1, bytes).unwrap());
            }
        })
    });
    group.finish();
}

fn bench_compression(c: &mut Criterion) {
    let samples = generate_samples(1, 10_000);
    let metadata = MetadataRecord::new(1, "bench").with_compression_limit(0.05);

    c.bench_function("compression_evaluate_10k", |b| {
        b.iter(|| {
            let mut engine = CompressionEngine::new(true);
            let mut state = CompressionState::new(1);
            let mut archived = 0usize;
            for sample in &samples {
                if engine.evaluate(&mut state, *sample, &metadata).archive.is_some() {
                    archived += 1;
                }
            }
            black_box(archived)
        })
    });
}

fn bench_archive_write(c: &mut Criterion) {
    let samples = generate_samples(1, 1_000);
    let mut group = c.benchmark_group("archive_write");
    group.throughput(Throughput::Elements(samples.len() as u64));
    group.sample_size(20);

    for compress in [true, false] {
        let name = if compress { "compressed_1k" } else { "uncompressed_1k" };
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let archive = open_archive(&dir, compress);
                    (dir, archive)
                },
                |(_dir, archive)| {
                    for sample in &samples {
                        black_box(archive.write(*sample).unwrap());
                    }
                },
                BatchSize::PerIteration,
            )
        });
    }
    group.finish();
}

fn bench_archive_read(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let archive = open_archive(&dir, false);
    for (i, sample) in generate_samples(1, 20_000).into_iter().enumerate() {
        archive.write(sample).unwrap();
        if i == 10_000 {
            archive.rollover().unwrap();
        }
    }

    let mut group = c.benchmark_group("archive_read");
    group.bench_function("read_all_20k", |b| {
        b.iter(|| black_box(archive.read_all(1).unwrap().count()))
    });
    group.bench_function("read_range_across_files", |b| {
        let start = TimeTag::from_millis_saturating(9_000_000);
        let end = TimeTag::from_millis_saturating(11_000_000);
        b.iter(|| black_box(archive.read(1, start, end).unwrap().count()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_record_codec,
    bench_compression,
    bench_archive_write,
    bench_archive_read,
);
criterion_main!(benches);
