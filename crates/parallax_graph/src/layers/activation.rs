use crate::layer::{expect_inputs, Layer, LayerContext, LayerKind};
use parallax_core::{error::Result, shape::Shape};
use parallax_cpu::ops;
use serde::{Deserialize, Serialize};

#[derive(LayerKind, Clone, Debug, Default)]
#[layer(kind = "identity")]
pub struct Identity;

impl Identity {
    pub fn new(_: ()) -> Result<Self> {
        Ok(Self)
    }
}

impl Layer for Identity {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        expect_inputs(Self::KIND, inputs, 1)?;
        Ok(vec![inputs[0].to_vec()])
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let x = ctx.input(0)?.value()?;
        let mut y = ctx.output(0)?.value_mut()?;
        ops::identity_forward(x.as_slice(), y.as_mut_slice());
        Ok(())
    }

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let x = ctx.input(0)?.value()?;
        let dy = ctx.output(0)?.grad()?;
        let mut dx = ctx.input(0)?.grad_mut()?;
        ops::identity_backward(x.as_slice(), dy.as_slice(), dx.as_mut_slice());
        Ok(())
    }
}

#[derive(LayerKind, Clone, Debug, Default)]
#[layer(kind = "relu")]
pub struct Relu;

impl Relu {
    pub fn new(_: ()) -> Result<Self> {
        Ok(Self)
    }
}

impl Layer for Relu {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        expect_inputs(Self::KIND, inputs, 1)?;
        Ok(vec![inputs[0].to_vec()])
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let x = ctx.input(0)?.value()?;
        let mut y = ctx.output(0)?.value_mut()?;
        ops::relu_forward(x.as_slice(), y.as_mut_slice());
        Ok(())
    }

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let x = ctx.input(0)?.value()?;
        let dy = ctx.output(0)?.grad()?;
        let mut dx = ctx.input(0)?.grad_mut()?;
        ops::relu_backward(x.as_slice(), dy.as_slice(), dx.as_mut_slice());
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    pub factor: f32,
}

impl Default for ScaleParams {
    fn default() -> Self {
        Self { factor: 1.0 }
    }
}

/// `y = factor * x`
#[derive(LayerKind, Clone, Debug)]
#[layer(kind = "scale", params = ScaleParams)]
pub struct Scale {
    factor: f32,
}

impl Scale {
    pub fn new(params: ScaleParams) -> Result<Self> {
        Ok(Self { factor: params.factor })
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }
}

impl Layer for Scale {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        expect_inputs(Self::KIND, inputs, 1)?;
        Ok(vec![inputs[0].to_vec()])
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let x = ctx.input(0)?.value()?;
        let mut y = ctx.output(0)?.value_mut()?;
        ops::scale_forward(x.as_slice(), self.factor, y.as_mut_slice());
        Ok(())
    }

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let dy = ctx.output(0)?.grad()?;
        let mut dx = ctx.input(0)?.grad_mut()?;
        ops::scale_backward(dy.as_slice(), self.factor, dx.as_mut_slice());
        Ok(())
    }
}
