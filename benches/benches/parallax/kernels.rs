use criterion::{black_box, BenchmarkId, Criterion};
use parallax_cpu::{matmul, ops};

const SIZES: [(usize, &str); 3] = [(1 << 10, "small"), (1 << 16, "medium"), (1 << 20, "large")];

pub fn elementwise(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("kernels/elementwise");
    group.warm_up_time(core::time::Duration::from_millis(500));
    group.measurement_time(core::time::Duration::from_secs(3));
    group.sample_size(50);

    for (size, label) in SIZES {
        let x: Vec<f32> = (0..size).map(|i| (i as f32).sin()).collect();
        let mut y = vec![0.0f32; size];

        group.bench_with_input(BenchmarkId::new("relu_forward", label), &x, |b, x| {
            b.iter(|| ops::relu_forward(black_box(x), &mut y))
        });
        group.bench_with_input(BenchmarkId::new("axpy", label), &x, |b, x| {
            b.iter(|| ops::axpy(black_box(0.5), black_box(x), &mut y))
        });
    }
    group.finish();
}

pub fn inner_product(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("kernels/inner_product");
    group.sample_size(30);

    for (batch, features, outputs) in [(8, 256, 64), (32, 1024, 256)] {
        let input: Vec<f32> = (0..batch * features).map(|i| (i % 13) as f32 * 0.1).collect();
        let weight: Vec<f32> = (0..outputs * features).map(|i| (i % 7) as f32 * 0.01).collect();
        let bias = vec![0.1f32; outputs];
        let mut output = vec![0.0f32; batch * outputs];
        let label = format!("{}x{}x{}", batch, features, outputs);

        group.bench_function(BenchmarkId::new("forward", label), |b| {
            b.iter(|| {
                matmul::inner_product_forward(
                    black_box(&input),
                    black_box(&weight),
                    Some(bias.as_slice()),
                    batch,
                    features,
                    outputs,
                    &mut output,
                )
            })
        });
    }
    group.finish();
}
