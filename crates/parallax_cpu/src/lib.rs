//! Host kernels for the built-in operator kinds.
//!
//! Every kernel writes each output element from a single sequential loop, so
//! results are bit-identical for any rayon thread count. Backward kernels
//! accumulate into their gradient outputs.

pub mod loss;
pub mod matmul;
pub mod ops;
pub mod reduction;
pub mod update;
