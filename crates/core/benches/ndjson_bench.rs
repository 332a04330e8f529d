//! Probe and extraction throughput over generated NDJSON dumps

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tailcast_core::ndjson;
use tempfile::TempDir;

fn generate_dump(dir: &TempDir, lines: usize) -> PathBuf {
    let path = dir.path().join(format!("dump_{}.json", lines));
    let mut out = BufWriter::new(File::create(&path).unwrap());
    for i in 0..lines {
        writeln!(
            out,
            "{{\"seq\":{},\"event\":\"update\",\"payload\":\"abcdefghijklmnop\"}}",
            i
        )
        .unwrap();
    }
    path
}

fn bench_count_lines(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut group = c.benchmark_group("count_lines");

    for lines in [100usize, 1_000, 10_000] {
        let path = generate_dump(&dir, lines);
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &path, |b, path| {
            b.iter(|| black_box(ndjson::count_lines(path)));
        });
    }

    group.finish();
}

fn bench_last_record(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut group = c.benchmark_group("last_record");

    for lines in [100usize, 1_000, 10_000] {
        let path = generate_dump(&dir, lines);
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &path, |b, path| {
            b.iter(|| black_box(ndjson::last_record(path)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_count_lines, bench_last_record);
criterion_main!(benches);
