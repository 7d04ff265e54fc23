//! Background batch preparation that overlaps with training.
//!
//! The intended loop feeds the ready batch, starts the training step, starts
//! preparing the next batch, then waits for both:
//!
//! ```text
//! fetch.run()?;
//! loop {
//!     model.feed(fetch.images()?, fetch.labels()?)?;
//!     model.run_async()?;
//!     fetch.run_async()?;
//!     fetch.sync()?;
//!     model.sync()?;
//! }
//! ```

pub mod augment;
pub mod fetcher;
pub mod source;

use crate::batch::Batch;
use parallax_core::error::Result;

pub trait Prefetcher {
    /// Prepares one set of batches and waits for it.
    fn run(&mut self) -> Result<()> {
        self.run_async()?;
        self.sync()
    }

    fn run_async(&mut self) -> Result<()>;

    fn sync(&mut self) -> Result<()>;

    /// One image batch per placement, valid after `sync`.
    fn images(&self) -> Result<&[Batch]>;

    fn labels(&self) -> Result<&[Batch]>;
}
