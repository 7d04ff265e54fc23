use crate::{
    layer::{Layer, LayerContext, LayerKind, LayerSpec},
    registry::LayerRegistry,
};
use parallax_core::{
    error::{Error, Result},
    placement::Placement,
    shape::Shape,
    tensor::Tensor,
};
use std::{
    cmp::Reverse,
    collections::{BTreeSet, BinaryHeap, HashMap},
    fmt::Write,
    sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

impl TensorId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(usize);

impl OperatorId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// How a tensor came into the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    /// Declared with `create`; fed from outside or left as a constant.
    Leaf,
    /// Written by the operator's forward.
    Output(OperatorId),
    /// Learnable parameter owned by the operator.
    Parameter(OperatorId),
}

#[derive(Clone)]
struct Slot {
    tensor: Arc<Tensor>,
    role: TensorRole,
}

pub struct Operator {
    name: String,
    spec: LayerSpec,
    layer: Box<dyn Layer>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    params: Vec<TensorId>,
    connected: bool,
}

impl Operator {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.spec.kind
    }

    pub fn spec(&self) -> LayerSpec {
        self.spec
    }

    pub fn layer(&self) -> &dyn Layer {
        self.layer.as_ref()
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn params(&self) -> &[TensorId] {
        &self.params
    }

    fn duplicate(&self) -> Self {
        Self {
            name: self.name.clone(),
            spec: self.spec,
            layer: self.layer.clone_box(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            params: self.params.clone(),
            connected: self.connected,
        }
    }
}

/// Declares tensors and operators, wires them, and freezes the result into a
/// [`Graph`].
///
/// Everything in one builder lives on a single placement.
pub struct GraphBuilder {
    placement: Placement,
    tensors: Vec<Slot>,
    tensor_names: HashMap<String, TensorId>,
    operators: Vec<Operator>,
    operator_names: HashMap<String, OperatorId>,
    inputs: Vec<TensorId>,
    losses: Vec<TensorId>,
}

impl GraphBuilder {
    pub fn new(placement: Placement) -> Self {
        Self {
            placement,
            tensors: Vec::new(),
            tensor_names: HashMap::new(),
            operators: Vec::new(),
            operator_names: HashMap::new(),
            inputs: Vec::new(),
            losses: Vec::new(),
        }
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Declares a leaf tensor.
    pub fn create(&mut self, name: &str, shape: &[usize]) -> Result<TensorId> {
        self.insert_tensor(name, shape, TensorRole::Leaf)
    }

    pub fn add_operator<L: LayerKind>(&mut self, name: &str, params: L::Params) -> Result<OperatorId> {
        let layer = L::from_params(params)?;
        self.add_layer(name, LayerSpec::of::<L>(), Box::new(layer))
    }

    pub fn add_operator_by_kind(
        &mut self,
        name: &str,
        kind: &str,
        params: serde_json::Value,
        registry: &LayerRegistry,
    ) -> Result<OperatorId> {
        let (spec, layer) = registry.create(kind, params)?;
        self.add_layer(name, spec, layer)
    }

    pub fn add_layer(&mut self, name: &str, spec: LayerSpec, layer: Box<dyn Layer>) -> Result<OperatorId> {
        if self.operator_names.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        let id = OperatorId(self.operators.len());
        self.operators.push(Operator {
            name: name.to_string(),
            spec,
            layer,
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: Vec::new(),
            connected: false,
        });
        self.operator_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Wires `inputs` into `op` and creates its outputs, named `{op}.out` for a
    /// single output and `{op}.out{i}` otherwise.
    pub fn connect(&mut self, inputs: &[TensorId], op: OperatorId) -> Result<Vec<TensorId>> {
        let out_shapes = self.check_inputs(inputs, op)?;
        let (name, n) = {
            let operator = &self.operators[op.0];
            (operator.name.clone(), operator.spec.outputs)
        };
        if out_shapes.len() != n {
            return Err(Error::Arity {
                operator: name,
                expected: n,
                got: out_shapes.len(),
            });
        }

        for i in 0..n {
            let out_name = if n == 1 { format!("{}.out", name) } else { format!("{}.out{}", name, i) };
            if self.tensor_names.contains_key(&out_name) {
                return Err(Error::DuplicateName(out_name));
            }
        }
        let outputs = out_shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| {
                let out_name = if n == 1 { format!("{}.out", name) } else { format!("{}.out{}", name, i) };
                self.insert_tensor(&out_name, shape, TensorRole::Output(op))
            })
            .collect::<Result<Vec<_>>>()?;

        self.bind(inputs, op, outputs.clone())?;
        Ok(outputs)
    }

    /// Like [`connect`](Self::connect) but writes into tensors declared with
    /// `create`. Their shapes must match what the operator produces.
    pub fn connect_to(&mut self, inputs: &[TensorId], op: OperatorId, outputs: &[TensorId]) -> Result<()> {
        let out_shapes = self.check_inputs(inputs, op)?;
        let operator = &self.operators[op.0];
        if outputs.len() != operator.spec.outputs {
            return Err(Error::Arity {
                operator: operator.name.clone(),
                expected: operator.spec.outputs,
                got: outputs.len(),
            });
        }

        for (id, expected) in outputs.iter().zip(&out_shapes) {
            let slot = self.slot(*id)?;
            match slot.role {
                TensorRole::Leaf => {}
                TensorRole::Output(other) => {
                    return Err(Error::InvalidState(format!(
                        "'{}' is already produced by '{}'",
                        slot.tensor.name(),
                        self.operators[other.0].name
                    )))
                }
                TensorRole::Parameter(_) => {
                    return Err(Error::InvalidState(format!(
                        "'{}' is a parameter and cannot be an operator output",
                        slot.tensor.name()
                    )))
                }
            }
            if inputs.contains(id) {
                return Err(Error::Cycle(format!(
                    "'{}' is both an input and an output of '{}'",
                    slot.tensor.name(),
                    operator.name
                )));
            }
            if self.inputs.contains(id) {
                return Err(Error::InvalidState(format!(
                    "'{}' is a graph input and cannot be an operator output",
                    slot.tensor.name()
                )));
            }
            if slot.tensor.shape() != expected.as_slice() {
                return Err(Error::Shape(format!(
                    "{}: output '{}' has shape {:?}, operator produces {:?}",
                    operator.name,
                    slot.tensor.name(),
                    slot.tensor.shape(),
                    expected
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for id in outputs {
            if !seen.insert(*id) {
                return Err(Error::InvalidArgument(format!(
                    "{}: output '{}' bound twice",
                    operator.name,
                    self.tensors[id.0].tensor.name()
                )));
            }
        }

        for id in outputs {
            self.tensors[id.0].role = TensorRole::Output(op);
        }
        self.bind(inputs, op, outputs.to_vec())
    }

    /// Connects `ops` in sequence, feeding each operator the previous one's
    /// outputs, and returns the last outputs.
    pub fn chain(&mut self, inputs: &[TensorId], ops: &[OperatorId]) -> Result<Vec<TensorId>> {
        let mut current = inputs.to_vec();
        for op in ops {
            current = self.connect(&current, *op)?;
        }
        Ok(current)
    }

    /// Marks a leaf tensor as a per-iteration input (data, labels).
    pub fn mark_input(&mut self, id: TensorId) -> Result<()> {
        let slot = self.slot(id)?;
        if slot.role != TensorRole::Leaf {
            return Err(Error::InvalidArgument(format!(
                "'{}' is produced inside the graph and cannot be an input",
                slot.tensor.name()
            )));
        }
        if !self.inputs.contains(&id) {
            self.inputs.push(id);
        }
        Ok(())
    }

    /// Marks a tensor whose gradient is seeded with 1 before backward.
    pub fn mark_loss(&mut self, id: TensorId) -> Result<()> {
        self.slot(id)?;
        if !self.losses.contains(&id) {
            self.losses.push(id);
        }
        Ok(())
    }

    pub fn tensor_id(&self, name: &str) -> Result<TensorId> {
        self.tensor_names
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownName(format!("tensor '{}'", name)))
    }

    pub fn operator_id(&self, name: &str) -> Result<OperatorId> {
        self.operator_names
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownName(format!("operator '{}'", name)))
    }

    pub fn tensor(&self, id: TensorId) -> Result<&Arc<Tensor>> {
        Ok(&self.slot(id)?.tensor)
    }

    pub fn build(self) -> Result<Graph> {
        if let Some(op) = self.operators.iter().find(|op| !op.connected) {
            return Err(Error::InvalidState(format!(
                "operator '{}' is declared but never connected",
                op.name
            )));
        }

        let mut producers = vec![None; self.tensors.len()];
        let mut consumers = vec![Vec::new(); self.tensors.len()];
        for (i, op) in self.operators.iter().enumerate() {
            for out in &op.outputs {
                producers[out.0] = Some(OperatorId(i));
            }
            for input in &op.inputs {
                if !consumers[input.0].contains(&OperatorId(i)) {
                    consumers[input.0].push(OperatorId(i));
                }
            }
        }

        let order = topo_sort(&self.operators, &producers)?;

        let outputs = (0..self.tensors.len())
            .filter(|&i| matches!(self.tensors[i].role, TensorRole::Output(_)) && consumers[i].is_empty())
            .map(TensorId)
            .collect();
        let weights = self.operators.iter().flat_map(|op| op.params.iter().copied()).collect();

        log::debug!(
            "built graph on {}: {} tensors, {} operators",
            self.placement,
            self.tensors.len(),
            self.operators.len()
        );

        Ok(Graph {
            placement: self.placement,
            tensors: self.tensors,
            tensor_names: self.tensor_names,
            operators: self.operators,
            operator_names: self.operator_names,
            order,
            inputs: self.inputs,
            losses: self.losses,
            outputs,
            weights,
            producers,
            consumers,
        })
    }

    fn slot(&self, id: TensorId) -> Result<&Slot> {
        self.tensors
            .get(id.0)
            .ok_or_else(|| Error::UnknownName(format!("tensor #{}", id.0)))
    }

    fn insert_tensor(&mut self, name: &str, shape: &[usize], role: TensorRole) -> Result<TensorId> {
        if self.tensor_names.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        let tensor = Tensor::new(name, shape, self.placement)?;
        let id = TensorId(self.tensors.len());
        self.tensors.push(Slot {
            tensor: Arc::new(tensor),
            role,
        });
        self.tensor_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Validates the operator's state and inputs and returns its output shapes.
    fn check_inputs(&self, inputs: &[TensorId], op: OperatorId) -> Result<Vec<Shape>> {
        let operator = self
            .operators
            .get(op.0)
            .ok_or_else(|| Error::UnknownName(format!("operator #{}", op.0)))?;
        if operator.connected {
            return Err(Error::InvalidState(format!("operator '{}' is already connected", operator.name)));
        }
        if inputs.len() != operator.spec.inputs {
            return Err(Error::Arity {
                operator: operator.name.clone(),
                expected: operator.spec.inputs,
                got: inputs.len(),
            });
        }
        let shapes = inputs
            .iter()
            .map(|id| Ok(self.slot(*id)?.tensor.shape()))
            .collect::<Result<Vec<&[usize]>>>()?;
        operator.layer.infer_shapes(&shapes).map_err(|e| match e {
            Error::Shape(msg) => Error::Shape(format!("{}: {}", operator.name, msg)),
            other => other,
        })
    }

    fn bind(&mut self, inputs: &[TensorId], op: OperatorId, outputs: Vec<TensorId>) -> Result<()> {
        let (name, param_shapes) = {
            let operator = &self.operators[op.0];
            let shapes = inputs.iter().map(|id| self.tensors[id.0].tensor.shape()).collect::<Vec<_>>();
            (operator.name.clone(), operator.layer.param_shapes(&shapes))
        };
        let params = param_shapes
            .iter()
            .map(|(param, shape)| self.insert_tensor(&format!("{}.{}", name, param), shape, TensorRole::Parameter(op)))
            .collect::<Result<Vec<_>>>()?;

        let operator = &mut self.operators[op.0];
        operator.inputs = inputs.to_vec();
        operator.outputs = outputs;
        operator.params = params;
        operator.connected = true;
        Ok(())
    }
}

/// Kahn's algorithm; among ready operators the earliest declared runs first.
fn topo_sort(operators: &[Operator], producers: &[Option<OperatorId>]) -> Result<Vec<OperatorId>> {
    let n = operators.len();
    let mut successors = vec![BTreeSet::new(); n];
    let mut indegree = vec![0usize; n];
    for (i, op) in operators.iter().enumerate() {
        let deps: BTreeSet<usize> = op.inputs.iter().filter_map(|t| producers[t.0]).map(|p| p.0).collect();
        for d in deps {
            if successors[d].insert(i) {
                indegree[i] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n).filter(|&i| indegree[i] == 0).map(Reverse).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(OperatorId(i));
        for &s in &successors[i] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                ready.push(Reverse(s));
            }
        }
    }

    if order.len() != n {
        let stuck = (0..n)
            .filter(|&i| indegree[i] > 0)
            .map(|i| operators[i].name.as_str())
            .collect::<Vec<_>>();
        return Err(Error::Cycle(format!("operators {:?} depend on each other", stuck)));
    }
    Ok(order)
}

/// A frozen computation graph bound to one placement.
///
/// Tensors and operators live in arenas addressed by [`TensorId`] and
/// [`OperatorId`]. The weight list is positional: operators in declaration
/// order, each contributing its parameters in the order its kind creates them.
pub struct Graph {
    placement: Placement,
    tensors: Vec<Slot>,
    tensor_names: HashMap<String, TensorId>,
    operators: Vec<Operator>,
    operator_names: HashMap<String, OperatorId>,
    order: Vec<OperatorId>,
    inputs: Vec<TensorId>,
    losses: Vec<TensorId>,
    outputs: Vec<TensorId>,
    weights: Vec<TensorId>,
    producers: Vec<Option<OperatorId>>,
    consumers: Vec<Vec<OperatorId>>,
}

impl Graph {
    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensor_ids(&self) -> impl Iterator<Item = TensorId> {
        (0..self.tensors.len()).map(TensorId)
    }

    pub fn tensor(&self, id: TensorId) -> &Arc<Tensor> {
        &self.tensors[id.0].tensor
    }

    pub fn role(&self, id: TensorId) -> TensorRole {
        self.tensors[id.0].role
    }

    pub fn tensor_id(&self, name: &str) -> Result<TensorId> {
        self.tensor_names
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownName(format!("tensor '{}'", name)))
    }

    pub fn tensor_by_name(&self, name: &str) -> Result<&Arc<Tensor>> {
        Ok(self.tensor(self.tensor_id(name)?))
    }

    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    pub fn operator(&self, id: OperatorId) -> &Operator {
        &self.operators[id.0]
    }

    pub fn operator_id(&self, name: &str) -> Result<OperatorId> {
        self.operator_names
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownName(format!("operator '{}'", name)))
    }

    pub fn execution_order(&self) -> &[OperatorId] {
        &self.order
    }

    pub fn producer(&self, id: TensorId) -> Option<OperatorId> {
        self.producers[id.0]
    }

    pub fn consumers(&self, id: TensorId) -> &[OperatorId] {
        &self.consumers[id.0]
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn losses(&self) -> &[TensorId] {
        &self.losses
    }

    /// Operator outputs nothing consumes.
    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn weights(&self) -> &[TensorId] {
        &self.weights
    }

    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    pub fn weight(&self, index: usize) -> Result<&Arc<Tensor>> {
        self.weights
            .get(index)
            .map(|id| self.tensor(*id))
            .ok_or_else(|| Error::InvalidArgument(format!("weight index {} out of range (have {})", index, self.weights.len())))
    }

    /// Position of a weight named `"{operator}.{param}"`.
    pub fn weight_index(&self, key: &str) -> Option<usize> {
        self.weights.iter().position(|id| self.tensor(*id).name() == key)
    }

    pub fn weight_keys(&self) -> Vec<&str> {
        self.weights.iter().map(|id| self.tensor(*id).name()).collect()
    }

    pub fn weight_data(&self) -> Result<Vec<Vec<f32>>> {
        self.weights.iter().map(|id| self.tensor(*id).to_vec()).collect()
    }

    pub fn weight_diff(&self) -> Result<Vec<Vec<f32>>> {
        self.weights.iter().map(|id| self.tensor(*id).grad_to_vec()).collect()
    }

    /// Runs one operator's forward.
    pub fn forward(&self, op: OperatorId, training: bool, iteration: u64) -> Result<()> {
        self.with_context(op, training, iteration, |layer, ctx| layer.forward(ctx))
    }

    /// Runs one operator's backward, accumulating into input and parameter
    /// gradients.
    pub fn backward(&self, op: OperatorId, iteration: u64) -> Result<()> {
        self.with_context(op, true, iteration, |layer, ctx| layer.backward(ctx))
    }

    fn with_context<F>(&self, op: OperatorId, training: bool, iteration: u64, f: F) -> Result<()>
    where
        F: FnOnce(&dyn Layer, &LayerContext<'_>) -> Result<()>,
    {
        let operator = &self.operators[op.0];
        let collect = |ids: &[TensorId]| ids.iter().map(|id| self.tensor(*id).clone()).collect::<Vec<_>>();
        let inputs = collect(&operator.inputs);
        let outputs = collect(&operator.outputs);
        let params = collect(&operator.params);
        let ctx = LayerContext {
            name: &operator.name,
            inputs: &inputs,
            outputs: &outputs,
            params: &params,
            training,
            iteration,
        };
        f(operator.layer.as_ref(), &ctx)
    }

    /// Deep copy onto another placement. Ids stay valid across replicas and
    /// current values are carried over.
    pub fn replicate(&self, placement: Placement) -> Result<Graph> {
        let tensors = self
            .tensors
            .iter()
            .map(|slot| {
                let tensor = Tensor::new(slot.tensor.name(), slot.tensor.shape(), placement)?;
                tensor.value_mut()?.copy_from_host(slot.tensor.value()?.as_slice())?;
                Ok(Slot {
                    tensor: Arc::new(tensor),
                    role: slot.role,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Graph {
            placement,
            tensors,
            tensor_names: self.tensor_names.clone(),
            operators: self.operators.iter().map(Operator::duplicate).collect(),
            operator_names: self.operator_names.clone(),
            order: self.order.clone(),
            inputs: self.inputs.clone(),
            losses: self.losses.clone(),
            outputs: self.outputs.clone(),
            weights: self.weights.clone(),
            producers: self.producers.clone(),
            consumers: self.consumers.clone(),
        })
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "graph on {} ({} tensors, {} operators, {} weights)",
            self.placement,
            self.tensors.len(),
            self.operators.len(),
            self.weights.len()
        );
        for id in &self.order {
            let op = &self.operators[id.0];
            let names = |ids: &[TensorId]| ids.iter().map(|t| self.tensor(*t).name()).collect::<Vec<_>>().join(", ");
            let _ = writeln!(
                out,
                "  {:<16} {:<14} [{}] -> [{}]",
                op.name,
                op.spec.kind,
                names(&op.inputs),
                names(&op.outputs)
            );
            for p in &op.params {
                let t = self.tensor(*p);
                let _ = writeln!(out, "  {:<16} {:<14} {:?}", "", t.name(), t.shape());
            }
        }
        out
    }
}
