pub use crate::comm::{CommConfig, CommContext, RetryPolicy};
pub use crate::core::{
    error::{Error, Result},
    placement::{Placement, Topology},
    tensor::{Field, Tensor},
};
pub use crate::dispatch::{Dispatcher, Handle, RunMode};
pub use crate::graph::{
    initializer::{ConstantParams, GaussianParams, UniformParams},
    layers::{activation::ScaleParams, dropout::DropoutParams, linear::InnerProductParams},
    losses::softmax::SoftmaxLossParams,
    Add, Constant, Dropout, Gaussian, GlobalAverage, Graph, GraphBuilder, Identity, InnerProduct, Layer, LayerContext,
    LayerKind, LayerRegistry, ModelSpec, Relu, Scale, SoftmaxLoss, TensorId, Uniform,
};
pub use crate::parallel::{
    Batch, DataParallel, FetchConfig, Fetcher, IterationState, ParallelConfig, Prefetcher, Reduction, SyntheticSource,
    UpdateConfig,
};
