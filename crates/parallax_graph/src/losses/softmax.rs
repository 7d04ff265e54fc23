use crate::layer::{expect_inputs, Layer, LayerContext, LayerKind};
use parallax_core::{
    error::{Error, Result},
    shape::{self, Shape},
};
use parallax_cpu::loss;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftmaxLossParams {
    pub loss_weight: f32,
}

impl Default for SoftmaxLossParams {
    fn default() -> Self {
        Self { loss_weight: 1.0 }
    }
}

/// Softmax followed by multinomial logistic loss.
///
/// Inputs are `[N, C, ...]` logits and `N` class labels stored as `f32`. The
/// output is a single-element tensor holding the weighted mean loss. Labels do
/// not receive gradients.
#[derive(LayerKind, Clone, Debug)]
#[layer(kind = "softmax_loss", inputs = 2, params = SoftmaxLossParams)]
pub struct SoftmaxLoss {
    loss_weight: f32,
}

impl SoftmaxLoss {
    pub fn new(params: SoftmaxLossParams) -> Result<Self> {
        Ok(Self {
            loss_weight: params.loss_weight,
        })
    }

    pub fn loss_weight(&self) -> f32 {
        self.loss_weight
    }
}

impl Layer for SoftmaxLoss {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        expect_inputs(Self::KIND, inputs, 2)?;
        let (batch, _) = shape::flatten_batch(inputs[0])?;
        if shape::numel(inputs[1]) != batch {
            return Err(Error::Shape(format!(
                "{}: {} logits rows but labels {:?}",
                Self::KIND,
                batch,
                inputs[1]
            )));
        }
        Ok(vec![vec![1]])
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let logits = ctx.input(0)?;
        let (batch, classes) = shape::flatten_batch(logits.shape())?;
        let z = logits.value()?;
        let labels = ctx.input(1)?.value()?;

        let value = loss::softmax_loss_forward(z.as_slice(), labels.as_slice(), batch, classes, self.loss_weight)
            .ok_or_else(|| ctx.compute_error(format!("label outside [0, {})", classes)))?;
        ctx.output(0)?.value_mut()?.as_mut_slice()[0] = value;
        Ok(())
    }

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let logits = ctx.input(0)?;
        let (batch, classes) = shape::flatten_batch(logits.shape())?;
        let upstream = ctx.output(0)?.grad()?.as_slice()[0];
        let z = logits.value()?;
        let labels = ctx.input(1)?.value()?;
        let mut dz = logits.grad_mut()?;

        loss::softmax_loss_backward(
            z.as_slice(),
            labels.as_slice(),
            batch,
            classes,
            self.loss_weight,
            upstream,
            dz.as_mut_slice(),
        );
        Ok(())
    }

    fn differentiable_input(&self, index: usize) -> bool {
        index == 0
    }
}
