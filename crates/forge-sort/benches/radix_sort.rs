use criterion::{black_box, criterion_group, criterion_main, Criterion};
use forge_arena::Arena;
use forge_sort::radix_sort;

fn bench_radix_sort(c: &mut Criterion) {
    let mut keys: Vec<u64> = (0..50_000u64).map(|i| (i.wrapping_mul(2654435761)) % 1_000_000).collect();
    let arena = Arena::new(1 << 20).unwrap();
    c.bench_function("radix_sort_50k", |b| {
        b.iter(|| {
            let mut keys = keys.clone();
            let mut payload: Vec<u64> = (0..keys.len() as u64).collect();
            arena.reset();
            radix_sort(black_box(&mut keys), black_box(&mut payload), &arena);
        });
    });
    keys.clear();
}

criterion_group!(benches, bench_radix_sort);
criterion_main!(benches);
