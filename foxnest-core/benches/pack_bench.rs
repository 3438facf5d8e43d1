//! Delta and packfile benchmarks
//!
//! Run with: cargo bench --package foxnest-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use foxnest_core::delta;
use foxnest_core::{ObjectId, ObjectKind, PackOptions, PackReader, PackWriter};
use tempfile::TempDir;

/// Successive revisions of a text file, each appending one line
fn revisions(count: usize) -> Vec<Vec<u8>> {
    let mut body = String::new();
    (0..count)
        .map(|i| {
            body.push_str(&format!("line {:05}: lorem ipsum dolor sit amet, consectetur adipiscing\n", i));
            body.clone().into_bytes()
        })
        .collect()
}

fn bench_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta");
    for size in [64usize, 512, 4096] {
        let versions = revisions(size);
        let base = &versions[size - 2];
        let target = &versions[size - 1];
        group.bench_with_input(BenchmarkId::new("encode", size), &size, |b, _| {
            b.iter(|| black_box(delta::encode(base, target)));
        });
        let encoded = delta::encode(base, target);
        group.bench_with_input(BenchmarkId::new("apply", size), &size, |b, _| {
            b.iter(|| black_box(delta::apply(base, &encoded).unwrap()));
        });
    }
    group.finish();
}

fn bench_pack(c: &mut Criterion) {
    let objects: Vec<(ObjectId, Vec<u8>)> = revisions(200)
        .into_iter()
        .map(|payload| (ObjectId::compute(ObjectKind::Blob, &payload), payload))
        .collect();

    c.bench_function("pack_write_200_revisions", |b| {
        b.iter_with_setup(
            || TempDir::new().unwrap(),
            |dir| {
                let mut writer = PackWriter::new(PackOptions::default());
                for (id, payload) in &objects {
                    writer.add_object(*id, ObjectKind::Blob, payload.clone());
                }
                black_box(writer.write(dir.path()).unwrap());
            },
        );
    });

    let dir = TempDir::new().unwrap();
    let mut writer = PackWriter::new(PackOptions::default());
    for (id, payload) in &objects {
        writer.add_object(*id, ObjectKind::Blob, payload.clone());
    }
    let handle = writer.write(dir.path()).unwrap();
    let reader = PackReader::open(&handle.index_path).unwrap();
    c.bench_function("pack_read_all", |b| {
        b.iter(|| {
            for (id, _) in &objects {
                black_box(reader.get(id).unwrap());
            }
        });
    });
}

criterion_group!(benches, bench_delta, bench_pack);
criterion_main!(benches);
