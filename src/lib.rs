//! Distributed computation-graph execution.
//!
//! Graphs of operators are built per placement, executed asynchronously by a
//! [`Dispatcher`](crate::dispatch::Dispatcher), and trained data-parallel across
//! ranks with [`DataParallel`](crate::parallel::DataParallel).

pub use parallax_internal::*;
