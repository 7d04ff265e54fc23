use parallax_core::{
    error::{Error, Result},
    shape::Shape,
    tensor::Tensor,
};
pub use parallax_graph_macros::LayerKind;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, sync::Arc};

/// Everything an operator touches during one forward or backward step.
pub struct LayerContext<'a> {
    pub name: &'a str,
    pub inputs: &'a [Arc<Tensor>],
    pub outputs: &'a [Arc<Tensor>],
    pub params: &'a [Arc<Tensor>],
    pub training: bool,
    pub iteration: u64,
}

impl<'a> LayerContext<'a> {
    pub fn input(&self, i: usize) -> Result<&'a Tensor> {
        self.inputs.get(i).map(|t| t.as_ref()).ok_or_else(|| self.missing("input", i))
    }

    pub fn output(&self, i: usize) -> Result<&'a Tensor> {
        self.outputs.get(i).map(|t| t.as_ref()).ok_or_else(|| self.missing("output", i))
    }

    pub fn param(&self, i: usize) -> Result<&'a Tensor> {
        self.params.get(i).map(|t| t.as_ref()).ok_or_else(|| self.missing("parameter", i))
    }

    pub fn compute_error(&self, message: impl Into<String>) -> Error {
        Error::Compute {
            operator: self.name.to_string(),
            message: message.into(),
        }
    }

    fn missing(&self, what: &str, i: usize) -> Error {
        self.compute_error(format!("{} {} is not bound", what, i))
    }
}

/// An operator kind.
///
/// Forward reads `inputs` and `params` and overwrites `outputs`. Backward reads
/// output gradients and *adds* into input and parameter gradients, so a tensor
/// consumed by several operators ends up with the sum of their contributions.
pub trait Layer: LayerClone + Send + Sync {
    /// Output shapes for the given input shapes. Fails with `Shape` when the
    /// inputs are incompatible with the kind.
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>>;

    /// Learnable parameters created when the operator is connected, in the
    /// order they appear in the graph's weight list.
    fn param_shapes(&self, _inputs: &[&[usize]]) -> Vec<(&'static str, Shape)> {
        Vec::new()
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()>;

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()>;

    /// Whether gradients flow into input `index`. Label inputs return `false`.
    fn differentiable_input(&self, _index: usize) -> bool {
        true
    }
}

pub trait LayerClone {
    fn clone_box(&self) -> Box<dyn Layer>;
}

impl<T> LayerClone for T
where
    T: Layer + Clone + 'static,
{
    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A statically known layer type that can be created by name.
///
/// Usually derived:
///
/// ```ignore
/// #[derive(LayerKind, Clone)]
/// #[layer(kind = "scale", params = ScaleParams)]
/// pub struct Scale { factor: f32 }
/// ```
pub trait LayerKind: Layer + Sized + 'static {
    const KIND: &'static str;
    const INPUTS: usize;
    const OUTPUTS: usize;
    type Params: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn from_params(params: Self::Params) -> Result<Self>;
}

/// Kind metadata kept next to a type-erased layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpec {
    pub kind: &'static str,
    pub inputs: usize,
    pub outputs: usize,
}

impl LayerSpec {
    pub fn of<L: LayerKind>() -> Self {
        Self {
            kind: L::KIND,
            inputs: L::INPUTS,
            outputs: L::OUTPUTS,
        }
    }
}

/// Fails with `Shape` unless there are exactly `n` inputs, each non-empty.
pub(crate) fn expect_inputs<'s>(kind: &str, inputs: &[&'s [usize]], n: usize) -> Result<()> {
    if inputs.len() != n {
        return Err(Error::Shape(format!("{} expects {} input shapes, got {}", kind, n, inputs.len())));
    }
    for shape in inputs {
        parallax_core::shape::validate(shape)?;
    }
    Ok(())
}
