use parallax_core::error::{Error, Result};
use rand::{rngs::StdRng, Rng};

/// Per-sample preprocessing: mean subtraction, square crop and horizontal
/// mirroring of a `[C, H, W]` sample.
#[derive(Debug, Clone)]
pub struct Augment {
    mean: Vec<f32>,
    crop: usize,
    random_crop: bool,
    mirror: bool,
}

impl Augment {
    /// `mean` is empty, one value for all channels, or one value per channel.
    pub fn new(mean: Vec<f32>, crop: usize, random_crop: bool, mirror: bool) -> Result<Self> {
        if crop == 0 {
            return Err(Error::InvalidArgument("crop size must be positive".into()));
        }
        Ok(Self {
            mean,
            crop,
            random_crop,
            mirror,
        })
    }

    pub fn crop(&self) -> usize {
        self.crop
    }

    pub fn output_len(&self, channels: usize) -> usize {
        channels * self.crop * self.crop
    }

    /// Checks that samples of `shape` can go through this pipeline.
    pub fn check(&self, shape: &[usize]) -> Result<()> {
        let &[c, h, w] = shape else {
            return Err(Error::Shape(format!("samples must be [C, H, W], got {:?}", shape)));
        };
        if self.crop > h || self.crop > w {
            return Err(Error::Shape(format!("crop {} larger than {}x{}", self.crop, h, w)));
        }
        if self.mean.len() > 1 && self.mean.len() != c {
            return Err(Error::Shape(format!("{} mean values for {} channels", self.mean.len(), c)));
        }
        Ok(())
    }

    pub fn apply(&self, sample: &[f32], shape: &[usize], rng: &mut StdRng, out: &mut [f32]) -> Result<()> {
        self.check(shape)?;
        let (c, h, w) = (shape[0], shape[1], shape[2]);
        if out.len() != self.output_len(c) {
            return Err(Error::Shape(format!(
                "output of {} values for crop {}x{}x{}",
                out.len(),
                c,
                self.crop,
                self.crop
            )));
        }

        let (top, left) = if self.random_crop {
            (rng.gen_range(0..=h - self.crop), rng.gen_range(0..=w - self.crop))
        } else {
            ((h - self.crop) / 2, (w - self.crop) / 2)
        };
        let flip = self.mirror && rng.gen_bool(0.5);

        let k = self.crop;
        for ch in 0..c {
            let mean = match self.mean.len() {
                0 => 0.0,
                1 => self.mean[0],
                _ => self.mean[ch],
            };
            for y in 0..k {
                let row = &sample[(ch * h + top + y) * w + left..][..k];
                let dst = &mut out[(ch * k + y) * k..][..k];
                for x in 0..k {
                    let src = if flip { k - 1 - x } else { x };
                    dst[x] = row[src] - mean;
                }
            }
        }
        Ok(())
    }
}
