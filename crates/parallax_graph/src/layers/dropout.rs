use crate::layer::{expect_inputs, Layer, LayerContext, LayerKind};
use parallax_core::{
    error::{Error, Result},
    placement::Placement,
    shape::Shape,
};
use parallax_cpu::ops;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DropoutParams {
    pub ratio: f32,
    #[serde(default)]
    pub seed: u64,
}

/// Inverted dropout. Each element is kept with probability `1 - ratio` and
/// scaled by `1 / (1 - ratio)`; evaluation runs pass values through.
///
/// The mask is a pure function of `(seed, iteration, placement)`, so backward
/// regenerates it instead of storing it.
#[derive(LayerKind, Clone, Debug)]
#[layer(kind = "dropout", params = DropoutParams)]
pub struct Dropout {
    ratio: f32,
    seed: u64,
}

impl Dropout {
    pub fn new(params: DropoutParams) -> Result<Self> {
        if !(0.0..1.0).contains(&params.ratio) {
            return Err(Error::InvalidArgument(format!(
                "dropout: ratio must be in [0, 1), got {}",
                params.ratio
            )));
        }
        Ok(Self {
            ratio: params.ratio,
            seed: params.seed,
        })
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    fn mask(&self, len: usize, iteration: u64, placement: Placement) -> Vec<f32> {
        let stream = ((placement.rank() as u64) << 32) ^ (placement.raw_device() as i64 as u64);
        let mut rng = StdRng::seed_from_u64(
            self.seed
                .wrapping_mul(0x9e37_79b9_7f4a_7c15)
                .wrapping_add(iteration)
                .rotate_left(17)
                ^ stream,
        );
        let scale = 1.0 / (1.0 - self.ratio);
        (0..len)
            .map(|_| if rng.gen::<f32>() >= self.ratio { scale } else { 0.0 })
            .collect()
    }
}

impl Layer for Dropout {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        expect_inputs(Self::KIND, inputs, 1)?;
        Ok(vec![inputs[0].to_vec()])
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let x = input.value()?;
        let mut y = ctx.output(0)?.value_mut()?;
        if !ctx.training || self.ratio == 0.0 {
            ops::copy(x.as_slice(), y.as_mut_slice());
            return Ok(());
        }
        let mask = self.mask(input.size(), ctx.iteration, input.placement());
        ops::mask_forward(x.as_slice(), &mask, y.as_mut_slice());
        Ok(())
    }

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let dy = ctx.output(0)?.grad()?;
        let mut dx = input.grad_mut()?;
        if !ctx.training || self.ratio == 0.0 {
            ops::accumulate(dy.as_slice(), dx.as_mut_slice());
            return Ok(());
        }
        let mask = self.mask(input.size(), ctx.iteration, input.placement());
        ops::mask_backward(dy.as_slice(), &mask, dx.as_mut_slice());
        Ok(())
    }
}
