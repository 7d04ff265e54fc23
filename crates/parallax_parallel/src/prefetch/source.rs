use parallax_core::{
    error::{Error, Result},
    shape,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Random access to labelled samples of a fixed `[C, H, W]` shape.
pub trait BatchSource: Send + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sample_shape(&self) -> &[usize];

    /// Writes sample `index` into `out` and returns its label.
    fn read(&self, index: usize, out: &mut [f32]) -> Result<u32>;
}

/// Deterministic generated samples. Sample `i` has label `i % classes` and
/// pixel values centred on a per-class level, so a model can learn it.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    samples: usize,
    classes: u32,
    shape: Vec<usize>,
    seed: u64,
}

impl SyntheticSource {
    pub fn new(samples: usize, classes: u32, shape: &[usize], seed: u64) -> Result<Self> {
        shape::validate(shape)?;
        if shape.len() != 3 {
            return Err(Error::Shape(format!("samples must be [C, H, W], got {:?}", shape)));
        }
        if samples == 0 || classes == 0 {
            return Err(Error::InvalidArgument("synthetic source needs samples and classes".into()));
        }
        Ok(Self {
            samples,
            classes,
            shape: shape.to_vec(),
            seed,
        })
    }

    /// Parses `synthetic:{samples}:{classes}:{C}x{H}x{W}`.
    pub fn parse(location: &str, seed: u64) -> Result<Self> {
        let bad = || Error::Config(format!("'{}' is not synthetic:<samples>:<classes>:<C>x<H>x<W>", location));
        let mut parts = location.split(':');
        if parts.next() != Some("synthetic") {
            return Err(bad());
        }
        let samples = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let classes = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let shape = parts
            .next()
            .ok_or_else(bad)?
            .split('x')
            .map(|d| d.parse::<usize>().map_err(|_| bad()))
            .collect::<Result<Vec<_>>>()?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Self::new(samples, classes, &shape, seed)
    }

    pub fn classes(&self) -> u32 {
        self.classes
    }
}

impl BatchSource for SyntheticSource {
    fn len(&self) -> usize {
        self.samples
    }

    fn sample_shape(&self) -> &[usize] {
        &self.shape
    }

    fn read(&self, index: usize, out: &mut [f32]) -> Result<u32> {
        if index >= self.samples {
            return Err(Error::InvalidArgument(format!(
                "sample {} out of range ({} samples)",
                index, self.samples
            )));
        }
        if out.len() != shape::numel(&self.shape) {
            return Err(Error::Shape(format!(
                "sample buffer of {} values for shape {:?}",
                out.len(),
                self.shape
            )));
        }
        let label = (index % self.classes as usize) as u32;
        let level = 255.0 * (label as f32 + 0.5) / self.classes as f32;
        let mut rng = StdRng::seed_from_u64(self.seed ^ (index as u64).wrapping_mul(0x2545_f491_4f6c_dd1d));
        for v in out.iter_mut() {
            *v = level + rng.gen_range(-8.0..8.0);
        }
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_location() -> Result<()> {
        let source = SyntheticSource::parse("synthetic:100:10:3x8x8", 1)?;
        assert_eq!(source.len(), 100);
        assert_eq!(source.classes(), 10);
        assert_eq!(source.sample_shape(), &[3, 8, 8]);

        for bad in ["file:/data", "synthetic:10", "synthetic:10:2:3x8", "synthetic:0:2:1x1x1", "synthetic:1:2:1x1x1:x"] {
            assert!(SyntheticSource::parse(bad, 1).is_err(), "{}", bad);
        }
        Ok(())
    }

    #[test]
    fn samples_are_reproducible() -> Result<()> {
        let source = SyntheticSource::new(8, 4, &[1, 2, 2], 3)?;
        let mut a = [0.0; 4];
        let mut b = [0.0; 4];
        assert_eq!(source.read(5, &mut a)?, 1);
        source.read(5, &mut b)?;
        assert_eq!(a, b);
        assert!(source.read(8, &mut a).is_err());
        Ok(())
    }
}
