use super::{augment::Augment, source::BatchSource, Prefetcher};
use crate::batch::Batch;
use crossbeam::channel::{self, Receiver, Sender};
use parallax_core::{
    error::{Error, Result},
    placement::Placement,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    path::Path,
    thread::{self, JoinHandle},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Where samples come from, e.g. `synthetic:1000:10:3x32x32`.
    pub source: String,
    /// Subtracted from every pixel; one value or one per channel.
    #[serde(default)]
    pub mean: Vec<f32>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub mirror: bool,
    #[serde(default)]
    pub random_crop: bool,
    /// Samples per placement.
    pub batch_size: usize,
    pub crop_size: usize,
    pub placements: Vec<Placement>,
    /// Batches are only materialized for placements on this rank.
    #[serde(default)]
    pub rank: usize,
    #[serde(default)]
    pub seed: u64,
}

impl FetchConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }
}

type Prepared = (Vec<Batch>, Vec<Batch>);

/// Walks the sample order of successive epochs. Every rank constructs the same
/// cursor, so placements on different ranks never draw the same samples
/// within an epoch.
struct Cursor {
    order: Vec<usize>,
    position: usize,
    epoch: u64,
    shuffle: bool,
    seed: u64,
}

impl Cursor {
    fn new(len: usize, shuffle: bool, seed: u64) -> Self {
        let mut cursor = Self {
            order: (0..len).collect(),
            position: 0,
            epoch: 0,
            shuffle,
            seed,
        };
        cursor.reorder();
        cursor
    }

    fn reorder(&mut self) {
        self.order.sort_unstable();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed ^ self.epoch.rotate_left(17));
            self.order.shuffle(&mut rng);
        }
    }

    fn next(&mut self) -> usize {
        if self.position == self.order.len() {
            self.position = 0;
            self.epoch += 1;
            self.reorder();
        }
        let index = self.order[self.position];
        self.position += 1;
        index
    }
}

struct Worker<S> {
    source: S,
    augment: Augment,
    batch_size: usize,
    placements: Vec<Placement>,
    rank: usize,
    seed: u64,
    cursor: Cursor,
    step: u64,
}

impl<S: BatchSource> Worker<S> {
    fn prepare(&mut self) -> Result<Prepared> {
        let shape = self.source.sample_shape().to_vec();
        let channels = shape[0];
        let crop = self.augment.crop();
        let out_len = self.augment.output_len(channels);
        let mut raw = vec![0.0; shape.iter().product()];

        let mut images = Vec::with_capacity(self.placements.len());
        let mut labels = Vec::with_capacity(self.placements.len());
        for (k, placement) in self.placements.iter().enumerate() {
            if placement.rank() != self.rank {
                for _ in 0..self.batch_size {
                    self.cursor.next();
                }
                images.push(Batch::empty());
                labels.push(Batch::empty());
                continue;
            }

            let mut rng = StdRng::seed_from_u64(self.seed ^ self.step.rotate_left(32) ^ k as u64);
            let mut data = vec![0.0; self.batch_size * out_len];
            let mut label = Vec::with_capacity(self.batch_size);
            for out in data.chunks_mut(out_len) {
                let index = self.cursor.next();
                label.push(self.source.read(index, &mut raw)? as f32);
                self.augment.apply(&raw, &shape, &mut rng, out)?;
            }
            images.push(Batch::new(data, vec![self.batch_size, channels, crop, crop])?);
            labels.push(Batch::new(label, vec![self.batch_size])?);
        }
        self.step += 1;
        Ok((images, labels))
    }

    fn run(mut self, requests: Receiver<()>, results: Sender<Result<Prepared>>) {
        for () in requests.iter() {
            let prepared = self.prepare();
            if let Err(e) = &prepared {
                log::error!("prefetch step {} failed: {}", self.step, e);
            }
            if results.send(prepared).is_err() {
                break;
            }
        }
        log::debug!("prefetch worker for rank {} stopped", self.rank);
    }
}

/// A [`Prefetcher`] backed by one background thread.
///
/// Each placement receives `batch_size` consecutive samples of the shared
/// epoch order per step, so every placement has its own batch stream.
pub struct Fetcher {
    requests: Option<Sender<()>>,
    results: Receiver<Result<Prepared>>,
    worker: Option<JoinHandle<()>>,
    pending: bool,
    ready: Option<Prepared>,
    placements: usize,
}

impl Fetcher {
    pub fn new<S: BatchSource>(config: &FetchConfig, source: S) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidArgument("batch size must be positive".into()));
        }
        if config.placements.is_empty() {
            return Err(Error::Config("prefetch needs at least one placement".into()));
        }
        if source.is_empty() {
            return Err(Error::InvalidArgument(format!("source '{}' has no samples", config.source)));
        }
        let augment = Augment::new(config.mean.clone(), config.crop_size, config.random_crop, config.mirror)?;
        augment.check(source.sample_shape())?;

        let worker = Worker {
            cursor: Cursor::new(source.len(), config.shuffle, config.seed),
            source,
            augment,
            batch_size: config.batch_size,
            placements: config.placements.clone(),
            rank: config.rank,
            seed: config.seed,
            step: 0,
        };
        let (request_tx, request_rx) = channel::unbounded();
        let (result_tx, result_rx) = channel::bounded(1);
        let handle = thread::Builder::new()
            .name(format!("prefetch-rank{}", config.rank))
            .spawn(move || worker.run(request_rx, result_tx))
            .map_err(|e| Error::InvalidState(format!("cannot start prefetch worker: {}", e)))?;

        Ok(Self {
            requests: Some(request_tx),
            results: result_rx,
            worker: Some(handle),
            pending: false,
            ready: None,
            placements: config.placements.len(),
        })
    }

    pub fn num_placements(&self) -> usize {
        self.placements
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    fn ready(&self) -> Result<&Prepared> {
        self.ready
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no prefetched batch; call sync first".into()))
    }
}

impl Prefetcher for Fetcher {
    fn run_async(&mut self) -> Result<()> {
        if self.pending {
            return Err(Error::InvalidState("a prefetch is already in flight".into()));
        }
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| Error::Aborted("prefetch worker stopped".into()))?;
        requests
            .send(())
            .map_err(|_| Error::Aborted("prefetch worker stopped".into()))?;
        self.ready = None;
        self.pending = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if !self.pending {
            return Err(Error::InvalidState("sync without a prefetch in flight".into()));
        }
        self.pending = false;
        let prepared = self
            .results
            .recv()
            .map_err(|_| Error::Aborted("prefetch worker stopped".into()))??;
        self.ready = Some(prepared);
        Ok(())
    }

    fn images(&self) -> Result<&[Batch]> {
        Ok(&self.ready()?.0)
    }

    fn labels(&self) -> Result<&[Batch]> {
        Ok(&self.ready()?.1)
    }
}

impl Drop for Fetcher {
    fn drop(&mut self) {
        self.requests.take();
        // unblock a worker waiting to hand over a finished batch
        while self.results.try_recv().is_ok() {}
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
