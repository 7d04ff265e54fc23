pub mod buffer;
pub mod error;
pub mod placement;
pub mod shape;
pub mod tensor;
