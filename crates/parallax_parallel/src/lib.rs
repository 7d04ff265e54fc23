pub mod batch;
pub mod config;
pub mod data_parallel;
pub mod prefetch;
pub mod server;

pub use crate::{
    batch::Batch,
    config::{ParallelConfig, Reduction, UpdateConfig},
    data_parallel::{DataParallel, IterationState, Phase},
    prefetch::{
        augment::Augment,
        fetcher::{FetchConfig, Fetcher},
        source::{BatchSource, SyntheticSource},
        Prefetcher,
    },
    server::ParameterServer,
};
