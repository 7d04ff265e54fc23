use crate::{
    error::{Error, Result},
    placement::Placement,
};

pub struct BufferManager {}

impl BufferManager {
    pub fn create(size: usize, placement: Placement) -> Result<Box<dyn Buffer>> {
        Ok(Box::new(HostBuffer::new(size, placement)?))
    }
}

pub trait Buffer: Send + Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn placement(&self) -> Placement;

    fn as_slice(&self) -> &[f32];
    fn as_mut_slice(&mut self) -> &mut [f32];

    fn copy_from(&mut self, other: &dyn Buffer) -> Result<()> {
        if !self.placement().same_rank(&other.placement()) {
            return Err(Error::Placement(format!(
                "direct copy from {} to {} crosses a process boundary",
                other.placement(),
                self.placement()
            )));
        }
        self.copy_from_host(other.as_slice())
    }

    fn copy_from_host(&mut self, src: &[f32]) -> Result<()> {
        if src.len() != self.len() {
            return Err(Error::Shape(format!(
                "copy of {} elements into a buffer of {}",
                src.len(),
                self.len()
            )));
        }
        self.as_mut_slice().copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host(&self, dest: &mut [f32]) -> Result<()> {
        if dest.len() != self.len() {
            return Err(Error::Shape(format!(
                "copy of a buffer of {} elements into {}",
                self.len(),
                dest.len()
            )));
        }
        dest.copy_from_slice(self.as_slice());
        Ok(())
    }

    fn accumulate_from_host(&mut self, src: &[f32]) -> Result<()> {
        if src.len() != self.len() {
            return Err(Error::Shape(format!(
                "accumulate of {} elements into a buffer of {}",
                src.len(),
                self.len()
            )));
        }
        for (d, s) in self.as_mut_slice().iter_mut().zip(src) {
            *d += *s;
        }
        Ok(())
    }

    fn fill(&mut self, value: f32) {
        self.as_mut_slice().fill(value);
    }
}

/// Host memory standing in for the storage of any placement on this rank.
pub struct HostBuffer {
    data: Vec<f32>,
    placement: Placement,
}

impl HostBuffer {
    pub fn new(size: usize, placement: Placement) -> Result<Self> {
        size.checked_mul(std::mem::size_of::<f32>())
            .ok_or_else(|| Error::InvalidArgument("Overflow in allocation".into()))?;
        Ok(Self {
            data: vec![0.0; size],
            placement,
        })
    }
}

impl Buffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    fn as_slice(&self) -> &[f32] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}
