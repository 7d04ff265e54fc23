pub mod graph;
pub mod initializer;
pub mod layer;
pub mod model;
pub mod registry;

pub mod layers;
pub mod losses;

pub use crate::{
    graph::{Graph, GraphBuilder, Operator, OperatorId, TensorId, TensorRole},
    initializer::{Constant, Gaussian, Initializer, InitializerKind, InitializerRegistry, Uniform},
    layer::{Layer, LayerContext, LayerKind, LayerSpec},
    layers::{
        activation::{Identity, Relu, Scale},
        dropout::Dropout,
        elementwise::Add,
        linear::InnerProduct,
        pooling::GlobalAverage,
    },
    losses::softmax::SoftmaxLoss,
    model::ModelSpec,
    registry::LayerRegistry,
};
