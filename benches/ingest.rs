use std::fmt::Write as _;
use std::io::Cursor;

use cinder::ingest::{perf, Options};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

fn synthetic_trace(records: usize) -> String {
    let mut text = String::new();
    for i in 0..records {
        writeln!(
            text,
            "worker {}/{} [00{}] {}.{:06}: cycles:",
            1000 + i % 8,
            2000 + i % 32,
            i % 4,
            1000 + i,
            i % 1000
        )
        .unwrap();
        for depth in 0..(3 + i % 5) {
            writeln!(
                text,
                "\t{:x} frame_{}_{} (libwork-{}.so)",
                0x40_0000 + depth * 0x100 + i % 16,
                depth,
                i % 11,
                depth % 3
            )
            .unwrap();
        }
        text.push('\n');
    }
    text
}

fn ingest_benchmark(c: &mut Criterion, id: &str, nthreads: usize) {
    let text = synthetic_trace(10_000);
    let mut group = c.benchmark_group("ingest");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function(id, |b| {
        b.iter(|| {
            let mut ingester = perf::Ingester::from(Options {
                nthreads,
                ..Options::default()
            });
            ingester
                .ingest(Cursor::new(text.as_bytes()))
                .expect("ingestion failed")
        })
    });
    group.finish();
}

fn serial(c: &mut Criterion) {
    ingest_benchmark(c, "perf-serial", 1);
}

fn parallel(c: &mut Criterion) {
    ingest_benchmark(c, "perf-parallel", 4);
}

criterion_group!(benches, serial, parallel);
criterion_main!(benches);
