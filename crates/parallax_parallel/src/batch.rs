use parallax_core::{
    error::{Error, Result},
    shape,
};

/// Host-side samples for one replica. `shape[0]` is the sample count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl Batch {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        shape::validate(&shape)?;
        if shape::numel(&shape) != data.len() {
            return Err(Error::Shape(format!(
                "batch of shape {:?} needs {} values, got {}",
                shape,
                shape::numel(&shape),
                data.len()
            )));
        }
        Ok(Self { data, shape })
    }

    /// Stand-in for a batch that belongs to another rank.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn samples(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn sample_len(&self) -> usize {
        shape::numel(self.shape.get(1..).unwrap_or(&[]))
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Splits into `parts` contiguous batches of `per_part` samples each.
    pub fn split(&self, parts: usize, per_part: usize) -> Result<Vec<Batch>> {
        if self.samples() != parts * per_part {
            return Err(Error::BatchSize {
                expected: parts * per_part,
                got: self.samples(),
            });
        }
        let stride = per_part * self.sample_len();
        let mut shape = self.shape.clone();
        shape[0] = per_part;
        self.data
            .chunks(stride.max(1))
            .take(parts)
            .map(|chunk| Batch::new(chunk.to_vec(), shape.clone()))
            .collect()
    }
}
