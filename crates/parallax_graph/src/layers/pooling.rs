use crate::layer::{Layer, LayerContext, LayerKind};
use parallax_core::{
    error::{Error, Result},
    shape::{self, Shape},
};
use parallax_cpu::reduction;

/// Averages every spatial plane: `[N, C, ...] -> [N, C]`.
#[derive(LayerKind, Clone, Debug, Default)]
#[layer(kind = "global_average")]
pub struct GlobalAverage;

impl GlobalAverage {
    pub fn new(_: ()) -> Result<Self> {
        Ok(Self)
    }

    fn planes(shape: &[usize]) -> (usize, usize) {
        (shape[0] * shape[1], shape::numel(&shape[2..]))
    }
}

impl Layer for GlobalAverage {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        let [input] = inputs else {
            return Err(Error::Shape(format!("{} expects one input shape", Self::KIND)));
        };
        shape::validate(input)?;
        if input.len() < 2 {
            return Err(Error::Shape(format!(
                "{} needs at least [N, C], got {:?}",
                Self::KIND,
                input
            )));
        }
        Ok(vec![vec![input[0], input[1]]])
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let (planes, spatial) = Self::planes(input.shape());
        let x = input.value()?;
        let mut y = ctx.output(0)?.value_mut()?;
        reduction::global_average_forward(x.as_slice(), planes, spatial, y.as_mut_slice());
        Ok(())
    }

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let (planes, spatial) = Self::planes(input.shape());
        let dy = ctx.output(0)?.grad()?;
        let mut dx = input.grad_mut()?;
        reduction::global_average_backward(dy.as_slice(), planes, spatial, dx.as_mut_slice());
        Ok(())
    }
}
