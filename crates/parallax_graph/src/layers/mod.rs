pub mod activation;
pub mod dropout;
pub mod elementwise;
pub mod linear;
pub mod pooling;
