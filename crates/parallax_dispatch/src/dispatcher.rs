use crate::{
    event::Event,
    handle::Handle,
    stream::{Stream, Work},
    trace::ExecutionTrace,
};
use parallax_core::{
    error::{Error, Result},
    placement::Placement,
    tensor::{Field, Tensor},
};
use parallax_graph::{Graph, TensorId};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Forward only.
    Inference,
    /// Gradient reset, forward, then backward in reverse order.
    Training,
}

/// Orders reads and writes of tensor halves within one submission.
#[derive(Default)]
struct Hazards {
    last_write: HashMap<(TensorId, Field), Event>,
    reads: HashMap<(TensorId, Field), Vec<Event>>,
}

impl Hazards {
    fn deps(&self, reads: &[(TensorId, Field)], writes: &[(TensorId, Field)]) -> Vec<Event> {
        let mut deps = Vec::new();
        for key in reads.iter().chain(writes) {
            if let Some(e) = self.last_write.get(key) {
                deps.push(e.clone());
            }
        }
        for key in writes {
            if let Some(readers) = self.reads.get(key) {
                deps.extend(readers.iter().cloned());
            }
        }
        deps
    }

    fn record(&mut self, reads: &[(TensorId, Field)], writes: &[(TensorId, Field)], event: &Event) {
        for key in reads {
            self.reads.entry(*key).or_default().push(event.clone());
        }
        for key in writes {
            self.last_write.insert(*key, event.clone());
            self.reads.remove(key);
        }
    }
}

/// Turns graph runs into tasks on per-placement streams of one rank.
pub struct Dispatcher {
    rank: usize,
    streams: Mutex<HashMap<Placement, Arc<Stream>>>,
    trace: Option<Arc<ExecutionTrace>>,
}

impl Dispatcher {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            streams: Mutex::new(HashMap::new()),
            trace: None,
        }
    }

    pub fn with_trace(rank: usize, trace: Arc<ExecutionTrace>) -> Self {
        Self {
            rank,
            streams: Mutex::new(HashMap::new()),
            trace: Some(trace),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn trace(&self) -> Option<&Arc<ExecutionTrace>> {
        self.trace.as_ref()
    }

    /// The stream for `placement`, started on first use.
    pub fn stream(&self, placement: Placement) -> Result<Arc<Stream>> {
        if placement.rank() != self.rank {
            return Err(Error::Placement(format!(
                "rank {} cannot execute on {}",
                self.rank, placement
            )));
        }
        let mut streams = self.streams.lock().map_err(|_| Error::Lock)?;
        if let Some(stream) = streams.get(&placement) {
            return Ok(stream.clone());
        }
        let stream = Arc::new(Stream::new(placement, self.trace.clone())?);
        streams.insert(placement, stream.clone());
        Ok(stream)
    }

    pub fn submit(&self, placement: Placement, label: impl Into<String>, deps: Vec<Event>, work: Work) -> Result<Event> {
        self.stream(placement)?.submit(label, deps, work)
    }

    /// Queues one iteration of `graph` on its placement's stream.
    ///
    /// In training mode every gradient is cleared first and loss gradients are
    /// seeded with 1, so backward accumulation starts from a clean slate.
    pub fn run_async(&self, graph: &Arc<Graph>, mode: RunMode, iteration: u64) -> Result<Handle> {
        let placement = graph.placement();
        let stream = self.stream(placement)?;
        let mut hazards = Hazards::default();
        let mut handle = Handle::new();
        let training = mode == RunMode::Training;

        if training {
            let writes: Vec<_> = graph.tensor_ids().map(|id| (id, Field::Grad)).collect();
            let g = graph.clone();
            let event = stream.submit(
                format!("{}/prepare", placement),
                hazards.deps(&[], &writes),
                Box::new(move || {
                    for id in g.tensor_ids() {
                        g.tensor(id).zero_grad()?;
                    }
                    for id in g.losses() {
                        g.tensor(*id).fill_grad(1.0)?;
                    }
                    Ok(())
                }),
            )?;
            hazards.record(&[], &writes, &event);
            handle.push(event);
        }

        for &op in graph.execution_order() {
            let operator = graph.operator(op);
            let reads: Vec<_> = operator
                .inputs()
                .iter()
                .chain(operator.params())
                .map(|id| (*id, Field::Value))
                .collect();
            let writes: Vec<_> = operator.outputs().iter().map(|id| (*id, Field::Value)).collect();

            let g = graph.clone();
            let event = stream.submit(
                format!("{}/forward/{}", placement, operator.name()),
                hazards.deps(&reads, &writes),
                Box::new(move || g.forward(op, training, iteration)),
            )?;
            hazards.record(&reads, &writes, &event);
            handle.push(event);
        }

        if training {
            for &op in graph.execution_order().iter().rev() {
                let operator = graph.operator(op);
                let mut reads: Vec<_> = operator
                    .inputs()
                    .iter()
                    .chain(operator.params())
                    .chain(operator.outputs())
                    .map(|id| (*id, Field::Value))
                    .collect();
                reads.extend(operator.outputs().iter().map(|id| (*id, Field::Grad)));
                let mut writes: Vec<_> = operator
                    .inputs()
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| operator.layer().differentiable_input(*i))
                    .map(|(_, id)| (*id, Field::Grad))
                    .collect();
                writes.extend(operator.params().iter().map(|id| (*id, Field::Grad)));
                writes.dedup();

                let g = graph.clone();
                let event = stream.submit(
                    format!("{}/backward/{}", placement, operator.name()),
                    hazards.deps(&reads, &writes),
                    Box::new(move || g.backward(op, iteration)),
                )?;
                hazards.record(&reads, &writes, &event);
                handle.push(event);
            }
        }

        log::trace!("queued {} tasks for {} (iteration {})", handle.events().len(), placement, iteration);
        Ok(handle)
    }

    /// Copies one half of `src` into `dst` on the destination's stream.
    /// Both tensors must live on this rank.
    pub fn transfer_async(&self, src: Arc<Tensor>, dst: Arc<Tensor>, field: Field, deps: Vec<Event>) -> Result<Event> {
        if !src.placement().same_rank(&dst.placement()) {
            return Err(Error::Placement(format!(
                "transfer {} -> {} crosses ranks; use the communicator",
                src.placement(),
                dst.placement()
            )));
        }
        if src.shape() != dst.shape() {
            return Err(Error::Shape(format!(
                "transfer '{}' {:?} -> '{}' {:?}",
                src.name(),
                src.shape(),
                dst.name(),
                dst.shape()
            )));
        }
        let label = format!("transfer/{}->{}", src.placement(), dst.placement());
        self.submit(
            dst.placement(),
            label,
            deps,
            Box::new(move || {
                if Arc::ptr_eq(&src, &dst) {
                    return Ok(());
                }
                let from = src.field(field)?;
                let mut to = dst.field_mut(field)?;
                to.copy_from(&**from)
            }),
        )
    }

    pub fn sync(&self, handle: &Handle) -> Result<()> {
        handle.wait()
    }

    /// Drains and joins every stream. Later submissions start fresh streams.
    pub fn shutdown(&self) {
        let streams: Vec<_> = match self.streams.lock() {
            Ok(mut streams) => streams.drain().map(|(_, s)| s).collect(),
            Err(_) => return,
        };
        for stream in streams {
            stream.shutdown();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
