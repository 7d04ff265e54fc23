use crate::{batch::Batch, config::ParallelConfig, server::ParameterServer};
use parallax_comm::{CommContext, MessageKind, Tag};
use parallax_core::{
    error::{Error, Result},
    placement::Placement,
    tensor::{Field, Tensor},
};
use parallax_dispatch::{Dispatcher, Event, ExecutionTrace, Handle, RunMode};
use parallax_graph::{Graph, Initializer, InitializerKind};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    fmt::Write as _,
    sync::{Arc, Mutex},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ForwardBackward,
    Aggregating,
}

/// Where the coordinator is within one training iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationState {
    Ready,
    Fed,
    Running(Phase),
    Synchronized,
    Failed,
}

struct Pending {
    compute: Handle,
    all: Handle,
}

/// Synchronous data parallelism over N structurally identical graphs.
///
/// Every rank constructs the coordinator with the same [`ParallelConfig`] and
/// factory. A rank only builds and runs the replicas placed on it; gradients
/// travel to the parameter-server rank, are reduced there in placement order,
/// and the updated weights plus the reduced gradient are sent back before
/// [`sync`](DataParallel::sync) returns. After every successful iteration all
/// replicas hold bit-identical weights.
///
/// Replicas never touch buffers of another placement directly: gradients are
/// copied into tensors on the parameter server's placement and results are
/// copied back out of exchange tensors, each copy a dispatcher transfer.
pub struct DataParallel {
    config: ParallelConfig,
    ctx: CommContext,
    dispatcher: Dispatcher,
    replicas: Vec<Option<Arc<Graph>>>,
    server: Option<Arc<Mutex<ParameterServer>>>,
    weight_sizes: Vec<usize>,
    weight_keys: Vec<String>,
    // weights and reduced gradients on the parameter server's placement, or on
    // this rank's host when the server is remote
    exchange: Vec<Arc<Tensor>>,
    // gradient landing tensors on the parameter server, one set per local replica
    gather: Vec<Option<Vec<Arc<Tensor>>>>,
    input_shapes: Vec<Vec<usize>>,
    state: IterationState,
    iteration: u64,
    init_calls: u64,
    pending: Option<Pending>,
}

impl DataParallel {
    /// Builds one replica per local placement with `factory`.
    pub fn new<F>(config: ParallelConfig, ctx: CommContext, factory: F) -> Result<Self>
    where
        F: Fn(Placement) -> Result<Graph>,
    {
        config.validate(ctx.world_size())?;
        let rank = ctx.rank();
        let template = factory(Placement::host(rank))?;
        let replicas = config
            .placements
            .iter()
            .map(|&p| {
                if p.rank() != rank {
                    return Ok(None);
                }
                let graph = factory(p)?;
                if graph.placement() != p {
                    return Err(Error::Placement(format!(
                        "factory built a graph on {} when asked for {}",
                        graph.placement(),
                        p
                    )));
                }
                Ok(Some(Arc::new(graph)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(config, ctx, &template, replicas)
    }

    /// Replicates `template` onto every local placement, values included.
    pub fn from_graph(config: ParallelConfig, ctx: CommContext, template: &Graph) -> Result<Self> {
        config.validate(ctx.world_size())?;
        let rank = ctx.rank();
        let replicas = config
            .placements
            .iter()
            .map(|&p| {
                if p.rank() != rank {
                    return Ok(None);
                }
                Ok(Some(Arc::new(template.replicate(p)?)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(config, ctx, template, replicas)
    }

    fn assemble(
        config: ParallelConfig,
        ctx: CommContext,
        template: &Graph,
        replicas: Vec<Option<Arc<Graph>>>,
    ) -> Result<Self> {
        let weight_sizes: Vec<usize> = template
            .weights()
            .iter()
            .map(|id| template.tensor(*id).size())
            .collect();
        let weight_keys: Vec<String> = template.weight_keys().into_iter().map(String::from).collect();
        let weight_shapes: Vec<Vec<usize>> = template
            .weights()
            .iter()
            .map(|id| template.tensor(*id).shape().to_vec())
            .collect();
        let input_shapes = template
            .inputs()
            .iter()
            .map(|id| template.tensor(*id).shape().to_vec())
            .collect();

        for graph in replicas.iter().flatten() {
            let sizes: Vec<usize> = graph.weights().iter().map(|id| graph.tensor(*id).size()).collect();
            if sizes != weight_sizes {
                return Err(Error::Shape(format!(
                    "replica on {} has weights {:?}, expected {:?}",
                    graph.placement(),
                    sizes,
                    weight_sizes
                )));
            }
        }

        let server = if config.param_server.rank() == ctx.rank() {
            let ps = ParameterServer::new(config.param_server, config.reduction, config.update, template.weight_data()?);
            Some(Arc::new(Mutex::new(ps)))
        } else {
            None
        };

        let exchange_at = match server {
            Some(_) => config.param_server,
            None => Placement::host(ctx.rank()),
        };
        let exchange = staging_tensors("exchange", &weight_keys, &weight_shapes, exchange_at)?;
        let gather = replicas
            .iter()
            .enumerate()
            .map(|(k, graph)| match (graph, &server) {
                (Some(_), Some(_)) => {
                    staging_tensors(&format!("gather{}", k), &weight_keys, &weight_shapes, config.param_server).map(Some)
                }
                _ => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "rank {}: {} of {} replicas local, {} weights, parameter server on {}",
            ctx.rank(),
            replicas.iter().flatten().count(),
            replicas.len(),
            weight_sizes.len(),
            config.param_server
        );

        Ok(Self {
            dispatcher: Dispatcher::new(ctx.rank()),
            config,
            ctx,
            replicas,
            server,
            weight_sizes,
            weight_keys,
            exchange,
            gather,
            input_shapes,
            state: IterationState::Ready,
            iteration: 0,
            init_calls: 0,
            pending: None,
        })
    }

    /// Records every task this coordinator issues into `trace`.
    pub fn with_trace(mut self, trace: Arc<ExecutionTrace>) -> Self {
        self.dispatcher = Dispatcher::with_trace(self.rank(), trace);
        self
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.ctx.rank()
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// The replica at position `index` of the placement list, if it lives on
    /// this rank.
    pub fn replica(&self, index: usize) -> Option<&Arc<Graph>> {
        self.replicas.get(index).and_then(Option::as_ref)
    }

    pub fn local_replicas(&self) -> impl Iterator<Item = &Arc<Graph>> {
        self.replicas.iter().flatten()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Number of completed iterations.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn num_weights(&self) -> usize {
        self.weight_sizes.len()
    }

    pub fn weight_keys(&self) -> &[String] {
        &self.weight_keys
    }

    /// Samples each replica consumes per iteration.
    pub fn batch_size(&self) -> Option<usize> {
        self.input_shapes.first().and_then(|s| s.first()).copied()
    }

    pub fn state(&self) -> IterationState {
        match (&self.state, &self.pending) {
            (IterationState::Running(Phase::ForwardBackward), Some(p)) if p.compute.is_complete() => {
                IterationState::Running(Phase::Aggregating)
            }
            (state, _) => *state,
        }
    }

    /// Master weights, when the parameter server lives on this rank.
    pub fn server_weights(&self) -> Result<Option<Vec<Vec<f32>>>> {
        self.server
            .as_ref()
            .map(|ps| Ok(ps.lock().map_err(|_| Error::Lock)?.weights().to_vec()))
            .transpose()
    }

    /// Summed loss value of each local replica for the last iteration.
    pub fn losses(&self) -> Result<Vec<f32>> {
        if self.state != IterationState::Synchronized {
            return Err(Error::InvalidState(format!(
                "losses are readable after sync, coordinator is {:?}",
                self.state
            )));
        }
        self.local_replicas()
            .map(|g| {
                g.losses()
                    .iter()
                    .map(|id| Ok(g.tensor(*id).to_vec()?.iter().sum::<f32>()))
                    .sum::<Result<f32>>()
            })
            .collect()
    }

    fn expect_idle(&self, what: &str) -> Result<()> {
        match self.state {
            IterationState::Running(_) | IterationState::Failed => Err(Error::InvalidState(format!(
                "cannot {} while the coordinator is {:?}",
                what, self.state
            ))),
            _ => Ok(()),
        }
    }

    /// Applies an initializer to the weights at `indices` of the flattened
    /// weight list, on every local replica and on the master copy.
    ///
    /// Values depend only on the configured seed, the number of earlier
    /// `init` calls and the index, so every rank computes the same numbers.
    pub fn init<I: InitializerKind>(&mut self, indices: &[usize], params: I::Params) -> Result<()> {
        let initializer = I::from_params(params)?;
        self.init_with(&initializer, indices)
    }

    /// Same as [`init`](Self::init) addressed by `"{operator}.{param}"`.
    pub fn init_by_key<I: InitializerKind>(&mut self, keys: &[&str], params: I::Params) -> Result<()> {
        let indices = keys
            .iter()
            .map(|key| {
                self.weight_keys
                    .iter()
                    .position(|k| k == key)
                    .ok_or_else(|| Error::UnknownName(format!("weight '{}'", key)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.init::<I>(&indices, params)
    }

    pub fn init_with(&mut self, initializer: &dyn Initializer, indices: &[usize]) -> Result<()> {
        self.expect_idle("initialize weights")?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.weight_sizes.len()) {
            return Err(Error::InvalidArgument(format!(
                "weight index {} out of range (have {})",
                bad,
                self.weight_sizes.len()
            )));
        }

        let call = self.init_calls;
        self.init_calls += 1;
        for &index in indices {
            let mut rng = StdRng::seed_from_u64(init_seed(self.config.seed, call, index));
            let mut values = vec![0.0; self.weight_sizes[index]];
            initializer.fill(&mut values, &mut rng)?;

            for graph in self.replicas.iter().flatten() {
                graph.weight(index)?.set_value(&values)?;
            }
            if let Some(ps) = &self.server {
                ps.lock().map_err(|_| Error::Lock)?.set_weight(index, &values)?;
            }
        }
        Ok(())
    }

    /// Writes one batch per placement into the replicas' input tensors. Batches
    /// for placements on other ranks are ignored and may be empty.
    pub fn feed(&mut self, images: &[Batch], labels: &[Batch]) -> Result<()> {
        self.expect_idle("feed")?;
        let n = self.replicas.len();
        for given in [images.len(), labels.len()] {
            if given != n {
                return Err(Error::BatchSize { expected: n, got: given });
            }
        }

        // nothing is written until every local batch fits
        let mut writes = Vec::new();
        for (graph, (image, label)) in self.replicas.iter().zip(images.iter().zip(labels)) {
            let Some(graph) = graph else { continue };
            let inputs = graph.inputs();
            if inputs.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "graph on {} declares no inputs",
                    graph.placement()
                )));
            }
            writes.push(check_batch(graph, 0, image)?);
            if inputs.len() > 1 {
                writes.push(check_batch(graph, 1, label)?);
            }
        }
        for (tensor, batch) in writes {
            tensor.set_value(batch.data())?;
        }

        self.state = IterationState::Fed;
        Ok(())
    }

    /// Partitions one global batch contiguously across the replicas in
    /// placement order.
    pub fn feed_global(&mut self, images: &Batch, labels: &Batch) -> Result<()> {
        let n = self.replicas.len();
        let per = self
            .batch_size()
            .ok_or_else(|| Error::InvalidArgument("graph declares no inputs".into()))?;
        let images = images.split(n, per)?;
        let labels = if self.input_shapes.len() > 1 {
            labels.split(n, per)?
        } else {
            vec![Batch::empty(); n]
        };
        self.feed(&images, &labels)
    }

    /// Queues forward/backward on every local replica followed by gradient
    /// aggregation and the broadcast of the updated weights.
    pub fn run_async(&mut self) -> Result<()> {
        if self.state != IterationState::Fed {
            return Err(Error::InvalidState(format!(
                "run_async requires fed inputs, coordinator is {:?}",
                self.state
            )));
        }
        let iteration = self.iteration;

        let mut compute = Vec::with_capacity(self.replicas.len());
        for graph in &self.replicas {
            compute.push(match graph {
                Some(g) => Some(self.dispatcher.run_async(g, RunMode::Training, iteration)?),
                None => None,
            });
        }

        let mut all = Handle::new();
        let mut compute_handle = Handle::new();
        for handle in compute.iter().flatten() {
            compute_handle.merge(handle.clone());
        }
        all.merge(compute_handle.clone());

        let exchange = match self.server.clone() {
            Some(server) => self.issue_server_side(server, &compute, iteration)?,
            None => self.issue_client_side(&compute, iteration)?,
        };
        all.merge(exchange);

        self.pending = Some(Pending {
            compute: compute_handle,
            all,
        });
        self.state = IterationState::Running(Phase::ForwardBackward);
        Ok(())
    }

    /// Gather local gradients and receive remote ones, reduce, update,
    /// broadcast, then copy the results back into local replicas.
    fn issue_server_side(
        &self,
        server: Arc<Mutex<ParameterServer>>,
        compute: &[Option<Handle>],
        iteration: u64,
    ) -> Result<Handle> {
        let ps = self.config.param_server;
        let comm = self.ctx.communicator().clone();
        let mut handle = Handle::new();
        let received: Arc<Mutex<Vec<Option<Vec<f32>>>>> = Arc::new(Mutex::new(vec![None; self.replicas.len()]));

        let mut deps: Vec<Event> = Vec::new();
        for (k, p) in self.config.placements.iter().enumerate() {
            match (&self.replicas[k], &self.gather[k], &compute[k]) {
                (Some(g), Some(landing), Some(done)) => {
                    for (i, dst) in landing.iter().enumerate() {
                        let event = self.dispatcher.transfer_async(
                            g.weight(i)?.clone(),
                            dst.clone(),
                            Field::Grad,
                            done.events().to_vec(),
                        )?;
                        deps.push(event.clone());
                        handle.push(event);
                    }
                }
                (None, _, _) => {
                    let (comm, received, src) = (comm.clone(), received.clone(), p.rank());
                    let event = self.dispatcher.submit(
                        ps,
                        format!("{}/recv/gradient/{}", ps, p),
                        Vec::new(),
                        Box::new(move || {
                            let payload = comm.recv(src, Tag::new(iteration, k as u32, MessageKind::Gradient))?;
                            received.lock().map_err(|_| Error::Lock)?[k] = Some(payload);
                            Ok(())
                        }),
                    )?;
                    deps.push(event.clone());
                    handle.push(event);
                }
                _ => return Err(Error::InvalidState(format!("replica {} has no gradient landing tensors", k))),
            }
        }

        let gather = self.gather.clone();
        let exchange = self.exchange.clone();
        let sizes = self.weight_sizes.clone();
        let reducer = server.clone();
        let aggregate = self.dispatcher.submit(
            ps,
            format!("{}/aggregate", ps),
            deps,
            Box::new(move || {
                let mut staged = received.lock().map_err(|_| Error::Lock)?;
                let grads = gather
                    .iter()
                    .zip(staged.iter_mut())
                    .map(|(landing, slot)| match landing {
                        Some(tensors) => tensors.iter().map(|t| t.grad_to_vec()).collect(),
                        None => {
                            let flat = slot
                                .take()
                                .ok_or_else(|| Error::InvalidState("missing received gradient".into()))?;
                            split(&flat, &sizes)
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                let mut master = reducer.lock().map_err(|_| Error::Lock)?;
                master.step(&grads)?;
                publish(&exchange, master.weights(), master.reduced())
            }),
        )?;
        handle.push(aggregate.clone());

        for dst in self.config.remote_replica_ranks() {
            let (comm, server) = (comm.clone(), server.clone());
            let event = self.dispatcher.submit(
                ps,
                format!("{}/broadcast/rank{}", ps, dst),
                vec![aggregate.clone()],
                Box::new(move || {
                    let (weights, reduced) = {
                        let ps = server.lock().map_err(|_| Error::Lock)?;
                        (ps.weights().concat(), ps.reduced().concat())
                    };
                    comm.send(dst, Tag::new(iteration, 0, MessageKind::Parameter), &weights)?;
                    comm.send(dst, Tag::new(iteration, 0, MessageKind::AggregatedGradient), &reduced)
                }),
            )?;
            handle.push(event);
        }

        for graph in self.replicas.iter().flatten() {
            self.scatter(graph, vec![aggregate.clone()], &mut handle)?;
        }
        Ok(handle)
    }

    /// Send local gradients to the parameter server and copy what it
    /// broadcasts back into every local replica.
    fn issue_client_side(&self, compute: &[Option<Handle>], iteration: u64) -> Result<Handle> {
        let mut handle = Handle::new();
        if self.replicas.iter().all(Option::is_none) {
            return Ok(handle);
        }
        let server_rank = self.config.param_server.rank();
        let comm = self.ctx.communicator().clone();

        let mut sends = Vec::new();
        for (k, (graph, done)) in self.replicas.iter().zip(compute).enumerate() {
            let (Some(g), Some(done)) = (graph, done) else { continue };
            let (g, comm) = (g.clone(), comm.clone());
            let event = self.dispatcher.submit(
                g.placement(),
                format!("{}/send/gradient", g.placement()),
                done.events().to_vec(),
                Box::new(move || {
                    let flat = g.weight_diff()?.concat();
                    comm.send(server_rank, Tag::new(iteration, k as u32, MessageKind::Gradient), &flat)
                }),
            )?;
            sends.push(event.clone());
            handle.push(event);
        }

        let host = Placement::host(self.rank());
        let received = {
            let (comm, exchange, sizes) = (comm.clone(), self.exchange.clone(), self.weight_sizes.clone());
            self.dispatcher.submit(
                host,
                format!("{}/recv/parameters", host),
                Vec::new(),
                Box::new(move || {
                    let weights = comm.recv(server_rank, Tag::new(iteration, 0, MessageKind::Parameter))?;
                    let reduced = comm.recv(server_rank, Tag::new(iteration, 0, MessageKind::AggregatedGradient))?;
                    publish(&exchange, &split(&weights, &sizes)?, &split(&reduced, &sizes)?)
                }),
            )?
        };
        handle.push(received.clone());

        for (graph, send) in self.replicas.iter().flatten().zip(sends) {
            self.scatter(graph, vec![received.clone(), send], &mut handle)?;
        }
        Ok(handle)
    }

    /// Copies the exchange tensors into `graph`'s weights, values and
    /// gradients both.
    fn scatter(&self, graph: &Graph, deps: Vec<Event>, handle: &mut Handle) -> Result<()> {
        for (i, src) in self.exchange.iter().enumerate() {
            let dst = graph.weight(i)?;
            for field in [Field::Value, Field::Grad] {
                let event = self
                    .dispatcher
                    .transfer_async(src.clone(), dst.clone(), field, deps.clone())?;
                handle.push(event);
            }
        }
        Ok(())
    }

    /// Blocks until the current iteration, aggregation and broadcast included,
    /// has finished. Any failure is fatal: streams are torn down and the
    /// communicator is aborted so peer ranks fail too.
    pub fn sync(&mut self) -> Result<()> {
        if !matches!(self.state, IterationState::Running(_)) {
            return Err(Error::InvalidState(format!(
                "sync without a running iteration, coordinator is {:?}",
                self.state
            )));
        }
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Error::InvalidState("no pending iteration".into()))?;

        match self.wait(&pending.all) {
            Ok(()) => {
                self.state = IterationState::Synchronized;
                self.iteration += 1;
                log::debug!("rank {} finished iteration {}", self.rank(), self.iteration);
                Ok(())
            }
            Err(e) => {
                log::error!("rank {} iteration {} failed: {}", self.rank(), self.iteration, e);
                self.state = IterationState::Failed;
                self.ctx.communicator().abort();
                self.dispatcher.shutdown();
                Err(e)
            }
        }
    }

    /// Waits in submission order. The first failure aborts the communicator
    /// right away, so receives still waiting on peers return instead of
    /// blocking forever.
    fn wait(&self, handle: &Handle) -> Result<()> {
        let mut first = Ok(());
        for event in handle.events() {
            if let Err(e) = event.wait() {
                if first.is_ok() {
                    log::warn!("rank {}: {} failed: {}", self.rank(), event.label(), e);
                    self.ctx.communicator().abort();
                    first = Err(e);
                }
            }
        }
        first
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "data parallel on rank {}: {} replicas, parameter server {}, {:?} reduction",
            self.rank(),
            self.replicas.len(),
            self.config.param_server,
            self.config.reduction
        );
        for (p, graph) in self.config.placements.iter().zip(&self.replicas) {
            let _ = writeln!(out, "  {} {}", p, if graph.is_some() { "local" } else { "remote" });
        }
        if let Some(graph) = self.local_replicas().next() {
            out.push_str(&graph.summary());
        }
        out
    }
}

fn check_batch<'a>(graph: &'a Graph, input: usize, batch: &'a Batch) -> Result<(&'a Arc<Tensor>, &'a Batch)> {
    let tensor = graph.tensor(graph.inputs()[input]);
    let expected = tensor.shape()[0];
    if batch.samples() != expected {
        return Err(Error::BatchSize {
            expected,
            got: batch.samples(),
        });
    }
    if batch.data().len() != tensor.size() {
        return Err(Error::Shape(format!(
            "batch of {} values for '{}' {:?}",
            batch.data().len(),
            tensor.name(),
            tensor.shape()
        )));
    }
    Ok((tensor, batch))
}

fn split(flat: &[f32], sizes: &[usize]) -> Result<Vec<Vec<f32>>> {
    let total: usize = sizes.iter().sum();
    if flat.len() != total {
        return Err(Error::Shape(format!(
            "payload of {} values for weights totalling {}",
            flat.len(),
            total
        )));
    }
    let mut offset = 0;
    Ok(sizes
        .iter()
        .map(|&n| {
            let part = flat[offset..offset + n].to_vec();
            offset += n;
            part
        })
        .collect())
}

fn publish(exchange: &[Arc<Tensor>], weights: &[Vec<f32>], reduced: &[Vec<f32>]) -> Result<()> {
    for (tensor, (w, g)) in exchange.iter().zip(weights.iter().zip(reduced)) {
        tensor.set_value(w)?;
        tensor.set_grad(g)?;
    }
    Ok(())
}

fn staging_tensors(prefix: &str, keys: &[String], shapes: &[Vec<usize>], placement: Placement) -> Result<Vec<Arc<Tensor>>> {
    keys.iter()
        .zip(shapes)
        .map(|(key, shape)| Ok(Arc::new(Tensor::new(format!("{}/{}", prefix, key), shape, placement)?)))
        .collect()
}

fn init_seed(seed: u64, call: u64, index: usize) -> u64 {
    seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ call.rotate_left(32) ^ index as u64
}
