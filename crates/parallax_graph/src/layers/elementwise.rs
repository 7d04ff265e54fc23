use crate::layer::{expect_inputs, Layer, LayerContext, LayerKind};
use parallax_core::{
    error::Result,
    shape::{self, Shape},
};
use parallax_cpu::ops;

/// `y = a + b`, both inputs of the same shape.
#[derive(LayerKind, Clone, Debug, Default)]
#[layer(kind = "add", inputs = 2)]
pub struct Add;

impl Add {
    pub fn new(_: ()) -> Result<Self> {
        Ok(Self)
    }
}

impl Layer for Add {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        expect_inputs(Self::KIND, inputs, 2)?;
        shape::expect_equal(Self::KIND, inputs[0], inputs[1])?;
        Ok(vec![inputs[0].to_vec()])
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let a = ctx.input(0)?.value()?;
        let b = ctx.input(1)?.value()?;
        let mut y = ctx.output(0)?.value_mut()?;
        ops::add_forward(a.as_slice(), b.as_slice(), y.as_mut_slice());
        Ok(())
    }

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let dy = ctx.output(0)?.grad()?;
        // one input at a time: both inputs may be the same tensor
        for i in 0..2 {
            let mut dx = ctx.input(i)?.grad_mut()?;
            ops::accumulate(dy.as_slice(), dx.as_mut_slice());
        }
        Ok(())
    }
}
