use crate::error::{Error, Result};

pub type Shape = Vec<usize>;

pub fn validate(shape: &[usize]) -> Result<()> {
    if shape.is_empty() {
        return Err(Error::Shape("shape must have at least one dimension".into()));
    }
    if let Some(dim) = shape.iter().position(|&d| d == 0) {
        return Err(Error::Shape(format!("dimension {} of {:?} is not positive", dim, shape)));
    }
    Ok(())
}

pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Splits `[N, d1, d2, ...]` into `(N, d1 * d2 * ...)`.
pub fn flatten_batch(shape: &[usize]) -> Result<(usize, usize)> {
    validate(shape)?;
    Ok((shape[0], numel(&shape[1..])))
}

pub fn expect_equal(op: &str, a: &[usize], b: &[usize]) -> Result<()> {
    if a != b {
        return Err(Error::Shape(format!("{}: shapes {:?} and {:?} differ", op, a, b)));
    }
    Ok(())
}
