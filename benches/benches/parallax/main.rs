use criterion::{criterion_group, criterion_main};

mod aggregation;
mod dispatch;
mod kernels;

criterion_group!(
    benches,
    kernels::elementwise,
    kernels::inner_product,
    dispatch::training_step,
    aggregation::parameter_server
);
criterion_main!(benches);
