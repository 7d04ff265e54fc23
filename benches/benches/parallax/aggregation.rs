use criterion::{black_box, BenchmarkId, Criterion};
use parallax_core::placement::Placement;
use parallax_parallel::{ParameterServer, Reduction, UpdateConfig};

pub fn parameter_server(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("aggregation/parameter_server");
    group.sample_size(30);

    let sizes = [64 * 1024, 1024, 16 * 1024, 64];
    for replicas in [2, 4, 8] {
        let weights: Vec<Vec<f32>> = sizes.iter().map(|&n| vec![0.01; n]).collect();
        let grads: Vec<Vec<Vec<f32>>> = (0..replicas)
            .map(|r| sizes.iter().map(|&n| vec![r as f32 * 0.001; n]).collect())
            .collect();
        let mut server = ParameterServer::new(Placement::host(0), Reduction::Mean, UpdateConfig::default(), weights);

        group.bench_function(BenchmarkId::new("step", replicas), |b| {
            b.iter(|| server.step(black_box(&grads)).unwrap())
        });
    }
    group.finish();
}
