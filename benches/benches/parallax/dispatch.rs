use criterion::{BenchmarkId, Criterion};
use parallax_core::placement::Placement;
use parallax_dispatch::{Dispatcher, RunMode};
use parallax_graph::{
    layers::{
        activation::Relu,
        linear::{InnerProduct, InnerProductParams},
    },
    losses::softmax::{SoftmaxLoss, SoftmaxLossParams},
    Graph, GraphBuilder,
};
use std::sync::Arc;

fn mlp(depth: usize, batch: usize, width: usize) -> Graph {
    let mut b = GraphBuilder::new(Placement::host(0));
    let data = b.create("data", &[batch, width]).unwrap();
    let label = b.create("label", &[batch]).unwrap();
    b.mark_input(data).unwrap();
    b.mark_input(label).unwrap();

    let mut x = vec![data];
    for i in 0..depth {
        let fc = b
            .add_operator::<InnerProduct>(&format!("fc{}", i), InnerProductParams::new(width))
            .unwrap();
        let relu = b.add_operator::<Relu>(&format!("relu{}", i), ()).unwrap();
        x = b.chain(&x, &[fc, relu]).unwrap();
    }
    let head = b
        .add_operator::<InnerProduct>("head", InnerProductParams::new(10))
        .unwrap();
    let loss = b
        .add_operator::<SoftmaxLoss>("loss", SoftmaxLossParams::default())
        .unwrap();
    let logits = b.connect(&x, head).unwrap();
    let out = b.connect(&[logits[0], label], loss).unwrap();
    b.mark_loss(out[0]).unwrap();
    b.build().unwrap()
}

pub fn training_step(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("dispatch/training_step");
    group.sample_size(30);
    let dispatcher = Dispatcher::new(0);

    for depth in [2, 8] {
        let graph = Arc::new(mlp(depth, 16, 128));
        let mut iteration = 0;
        group.bench_function(BenchmarkId::new("mlp", depth), |b| {
            b.iter(|| {
                let handle = dispatcher.run_async(&graph, RunMode::Training, iteration).unwrap();
                dispatcher.sync(&handle).unwrap();
                iteration += 1;
            })
        });
    }
    group.finish();
}
