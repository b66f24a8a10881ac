use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tscbench::{read, to_ns, ClockFrequency, CycleCount, FastConverter, ReadMode};

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    for mode in ReadMode::ALL {
        group.bench_function(mode.to_string(), |b| b.iter(|| black_box(read(black_box(mode)))));
    }
    group.finish();
}

fn bench_conversion(c: &mut Criterion) {
    let frequency = ClockFrequency::from_hz(3.0e9);
    let converter = FastConverter::new(frequency).expect("Failed to create FastConverter");
    let ticks = CycleCount(123_456_789);

    let mut group = c.benchmark_group("to_nanos");
    group.bench_function("float", |b| b.iter(|| to_ns(black_box(ticks), black_box(frequency))));
    group.bench_function("multiply_shift", |b| b.iter(|| converter.to_nanos(black_box(ticks))));
    group.finish();
}

criterion_group!(benches, bench_read, bench_conversion);
criterion_main!(benches);
