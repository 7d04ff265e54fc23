use crate::{
    buffer::{Buffer, BufferManager},
    error::{Error, Result},
    placement::Placement,
    shape::{self, Shape},
};
use std::{
    fmt,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

pub type BufferReadGuard<'a> = RwLockReadGuard<'a, Box<dyn Buffer>>;
pub type BufferWriteGuard<'a> = RwLockWriteGuard<'a, Box<dyn Buffer>>;

/// Which half of a tensor a transfer or copy touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Value,
    Grad,
}

/// A shape-described buffer pair bound to one placement for its lifetime.
///
/// `value` and `grad` always hold `numel(shape)` elements. Both start zeroed.
pub struct Tensor {
    name: String,
    shape: Shape,
    placement: Placement,
    value: RwLock<Box<dyn Buffer>>,
    grad: RwLock<Box<dyn Buffer>>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: &[usize], placement: Placement) -> Result<Self> {
        shape::validate(shape)?;
        let size = shape::numel(shape);

        Ok(Self {
            name: name.into(),
            shape: shape.to_vec(),
            placement,
            value: RwLock::new(BufferManager::create(size, placement)?),
            grad: RwLock::new(BufferManager::create(size, placement)?),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn size(&self) -> usize {
        shape::numel(&self.shape)
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn value(&self) -> Result<BufferReadGuard<'_>> {
        self.value.read().map_err(|_| Error::Lock)
    }

    pub fn value_mut(&self) -> Result<BufferWriteGuard<'_>> {
        self.value.write().map_err(|_| Error::Lock)
    }

    pub fn grad(&self) -> Result<BufferReadGuard<'_>> {
        self.grad.read().map_err(|_| Error::Lock)
    }

    pub fn grad_mut(&self) -> Result<BufferWriteGuard<'_>> {
        self.grad.write().map_err(|_| Error::Lock)
    }

    pub fn field(&self, field: Field) -> Result<BufferReadGuard<'_>> {
        match field {
            Field::Value => self.value(),
            Field::Grad => self.grad(),
        }
    }

    pub fn field_mut(&self, field: Field) -> Result<BufferWriteGuard<'_>> {
        match field {
            Field::Value => self.value_mut(),
            Field::Grad => self.grad_mut(),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.value()?.as_slice().to_vec())
    }

    pub fn grad_to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.grad()?.as_slice().to_vec())
    }

    pub fn set_value(&self, data: &[f32]) -> Result<()> {
        self.check_len(data.len())?;
        self.value_mut()?.copy_from_host(data)
    }

    pub fn set_grad(&self, data: &[f32]) -> Result<()> {
        self.check_len(data.len())?;
        self.grad_mut()?.copy_from_host(data)
    }

    pub fn fill_value(&self, value: f32) -> Result<()> {
        self.value_mut()?.fill(value);
        Ok(())
    }

    pub fn fill_grad(&self, value: f32) -> Result<()> {
        self.grad_mut()?.fill(value);
        Ok(())
    }

    pub fn zero_grad(&self) -> Result<()> {
        self.fill_grad(0.0)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.size() {
            return Err(Error::Shape(format!(
                "tensor '{}' of shape {:?} holds {} elements, got {}",
                self.name,
                self.shape,
                self.size(),
                len
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("placement", &self.placement)
            .finish()
    }
}
