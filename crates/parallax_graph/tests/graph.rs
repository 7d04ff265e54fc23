use parallax_core::{
    error::{Error, Result},
    placement::Placement,
    shape::Shape,
};
use parallax_graph::{
    layers::{
        activation::{Identity, Relu, Scale, ScaleParams},
        linear::{InnerProduct, InnerProductParams},
    },
    losses::softmax::{SoftmaxLoss, SoftmaxLossParams},
    Graph, GraphBuilder, Layer, LayerContext, LayerKind, LayerRegistry, TensorRole,
};
use serde_json::json;

fn run_training_step(graph: &Graph, iteration: u64) -> Result<()> {
    for id in graph.tensor_ids() {
        graph.tensor(id).zero_grad()?;
    }
    for op in graph.execution_order() {
        graph.forward(*op, true, iteration)?;
    }
    for loss in graph.losses() {
        graph.tensor(*loss).fill_grad(1.0)?;
    }
    for op in graph.execution_order().iter().rev() {
        graph.backward(*op, iteration)?;
    }
    Ok(())
}

#[test]
fn identity_then_scale_chain() -> Result<()> {
    let mut b = GraphBuilder::new(Placement::host(0));
    let x = b.create("x", &[4])?;
    b.mark_input(x)?;
    let a = b.add_operator::<Identity>("a", ())?;
    let s = b.add_operator::<Scale>("s", ScaleParams { factor: 3.0 })?;
    let out = b.chain(&[x], &[a, s])?;
    let graph = b.build()?;

    graph.tensor(x).set_value(&[1.0, -2.0, 0.5, 4.0])?;
    for id in graph.tensor_ids() {
        graph.tensor(id).zero_grad()?;
    }
    for op in graph.execution_order() {
        graph.forward(*op, true, 0)?;
    }
    graph.tensor(out[0]).set_grad(&[1.0, 0.5, -1.0, 2.0])?;
    for op in graph.execution_order().iter().rev() {
        graph.backward(*op, 0)?;
    }

    assert_eq!(graph.tensor(out[0]).to_vec()?, vec![3.0, -6.0, 1.5, 12.0]);
    assert_eq!(graph.tensor_by_name("a.out")?.grad_to_vec()?, vec![3.0, 1.5, -3.0, 6.0]);
    assert_eq!(graph.tensor(x).grad_to_vec()?, vec![3.0, 1.5, -3.0, 6.0]);
    Ok(())
}

#[test]
fn scaled_loss_gradient_flows_through_chain() -> Result<()> {
    let mut b = GraphBuilder::new(Placement::host(0));
    let x = b.create("x", &[4])?;
    b.mark_input(x)?;
    let s1 = b.add_operator::<Scale>("s1", ScaleParams { factor: 2.0 })?;
    let s2 = b.add_operator::<Scale>("s2", ScaleParams { factor: 3.0 })?;
    let head = b.add_operator::<Scale>("head", ScaleParams { factor: 0.5 })?;
    let out = b.chain(&[x], &[s1, s2, head])?;
    b.mark_loss(out[0])?;
    let graph = b.build()?;

    graph.tensor(x).set_value(&[1.0, -1.0, 2.0, 0.0])?;
    run_training_step(&graph, 1)?;

    assert_eq!(graph.tensor(out[0]).to_vec()?, vec![3.0, -3.0, 6.0, 0.0]);
    assert_eq!(graph.tensor_by_name("s2.out")?.grad_to_vec()?, vec![0.5; 4]);
    assert_eq!(graph.tensor_by_name("s1.out")?.grad_to_vec()?, vec![1.5; 4]);
    assert_eq!(graph.tensor(x).grad_to_vec()?, vec![3.0; 4]);
    Ok(())
}

#[test]
fn shape_inference_is_deterministic() -> Result<()> {
    let registry = LayerRegistry::with_builtin();
    let image: &[usize] = &[4, 6, 2, 2];
    let logits: &[usize] = &[4, 6];
    let labels: &[usize] = &[4];

    let mut checked = 0;
    for kind in registry.kinds() {
        let (params, inputs): (serde_json::Value, Vec<&[usize]>) = match kind {
            "identity" | "relu" | "global_average" => (serde_json::Value::Null, vec![image]),
            "scale" => (json!({ "factor": 2.0 }), vec![image]),
            "dropout" => (json!({ "ratio": 0.5 }), vec![image]),
            "inner_product" => (json!({ "num_output": 3 }), vec![image]),
            "add" => (serde_json::Value::Null, vec![image, image]),
            "softmax_loss" => (serde_json::Value::Null, vec![logits, labels]),
            other => panic!("no fixture for layer kind '{}'", other),
        };
        let (_, first) = registry.create(kind, params.clone())?;
        let (_, second) = registry.create(kind, params)?;

        let expected = first.infer_shapes(&inputs)?;
        for _ in 0..3 {
            assert_eq!(first.infer_shapes(&inputs)?, expected, "{}", kind);
        }
        assert_eq!(second.infer_shapes(&inputs)?, expected, "{}", kind);
        checked += 1;
    }
    assert_eq!(checked, 8);
    Ok(())
}

#[test]
fn shared_input_accumulates() -> Result<()> {
    let mut b = GraphBuilder::new(Placement::host(0));
    let x = b.create("x", &[3])?;
    let a = b.add_operator::<Scale>("a", ScaleParams { factor: 2.0 })?;
    let c = b.add_operator::<Scale>("c", ScaleParams { factor: 5.0 })?;
    let ya = b.connect(&[x], a)?;
    let yc = b.connect(&[x], c)?;
    b.mark_loss(ya[0])?;
    b.mark_loss(yc[0])?;
    let graph = b.build()?;

    assert_eq!(graph.consumers(x).len(), 2);
    run_training_step(&graph, 1)?;
    assert_eq!(graph.tensor(x).grad_to_vec()?, vec![7.0; 3]);
    Ok(())
}

#[test]
fn weights_in_declaration_order() -> Result<()> {
    let mut b = GraphBuilder::new(Placement::host(0));
    let x = b.create("x", &[4, 5])?;
    let fc2 = b.add_operator::<InnerProduct>("fc2", InnerProductParams::new(2))?;
    let fc1 = b.add_operator::<InnerProduct>("fc1", InnerProductParams::new(3))?;
    // connected in the opposite order from declaration
    let h = b.connect(&[x], fc1)?;
    b.connect(&h, fc2)?;
    let graph = b.build()?;

    assert_eq!(graph.weight_keys(), vec!["fc2.weight", "fc2.bias", "fc1.weight", "fc1.bias"]);
    assert_eq!(graph.weight_index("fc1.weight"), Some(2));
    assert_eq!(graph.weight_index("fc3.weight"), None);
    assert_eq!(graph.weight(0)?.shape(), &[2, 3]);
    assert!(graph.weight(4).is_err());
    assert!(matches!(graph.role(graph.weights()[0]), TensorRole::Parameter(_)));

    let order: Vec<&str> = graph.execution_order().iter().map(|id| graph.operator(*id).name()).collect();
    assert_eq!(order, vec!["fc1", "fc2"]);
    Ok(())
}

#[test]
fn shape_mismatch_is_reported() -> Result<()> {
    let mut b = GraphBuilder::new(Placement::host(0));
    let logits = b.create("logits", &[4, 10])?;
    let labels = b.create("labels", &[3])?;
    let loss = b.add_operator::<SoftmaxLoss>("loss", SoftmaxLossParams::default())?;
    let err = b.connect(&[logits, labels], loss);
    assert!(matches!(err, Err(Error::Shape(_))));
    assert!(matches!(b.create("bad", &[4, 0]), Err(Error::Shape(_))));
    Ok(())
}

#[test]
fn replicate_copies_values_onto_new_placement() -> Result<()> {
    let mut b = GraphBuilder::new(Placement::host(0));
    let x = b.create("x", &[1, 2])?;
    let fc = b.add_operator::<InnerProduct>("fc", InnerProductParams::new(2))?;
    let relu = b.add_operator::<Relu>("relu", ())?;
    b.chain(&[x], &[fc, relu])?;
    let graph = b.build()?;
    graph.weight(0)?.set_value(&[1.0, 2.0, 3.0, 4.0])?;

    let replica = graph.replicate(Placement::device_of(0, 1))?;
    assert_eq!(replica.placement(), Placement::device_of(0, 1));
    assert_eq!(replica.weight_data()?, graph.weight_data()?);
    assert_eq!(replica.execution_order(), graph.execution_order());

    replica.weight(0)?.fill_value(0.0)?;
    assert_eq!(graph.weight(0)?.to_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(replica.tensor(x).placement(), Placement::device_of(0, 1));
    Ok(())
}

#[test]
fn summary_lists_operators() -> Result<()> {
    let mut b = GraphBuilder::new(Placement::host(0));
    let x = b.create("x", &[2, 3])?;
    let fc = b.add_operator::<InnerProduct>("fc", InnerProductParams::new(4))?;
    b.connect(&[x], fc)?;
    let summary = b.build()?.summary();
    assert!(summary.contains("inner_product"));
    assert!(summary.contains("fc.weight"));
    Ok(())
}

/// A kind defined outside the crate: `y = x^2`.
#[derive(Clone)]
struct Square;

impl Layer for Square {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        Ok(vec![inputs[0].to_vec()])
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let x = ctx.input(0)?.value()?;
        let mut y = ctx.output(0)?.value_mut()?;
        for (y, x) in y.as_mut_slice().iter_mut().zip(x.as_slice()) {
            *y = x * x;
        }
        Ok(())
    }

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let x = ctx.input(0)?.value()?;
        let dy = ctx.output(0)?.grad()?;
        let mut dx = ctx.input(0)?.grad_mut()?;
        for ((g, x), dy) in dx.as_mut_slice().iter_mut().zip(x.as_slice()).zip(dy.as_slice()) {
            *g += 2.0 * x * dy;
        }
        Ok(())
    }
}

impl LayerKind for Square {
    const KIND: &'static str = "square";
    const INPUTS: usize = 1;
    const OUTPUTS: usize = 1;
    type Params = ();

    fn from_params(_: ()) -> Result<Self> {
        Ok(Square)
    }
}

#[test]
fn custom_kind_through_registry() -> Result<()> {
    let mut registry = LayerRegistry::with_builtin();
    registry.register::<Square>();

    let mut b = GraphBuilder::new(Placement::host(0));
    let x = b.create("x", &[2])?;
    let sq = b.add_operator_by_kind("sq", "square", serde_json::Value::Null, &registry)?;
    let y = b.connect(&[x], sq)?;
    b.mark_loss(y[0])?;
    let graph = b.build()?;

    graph.tensor(x).set_value(&[3.0, -2.0])?;
    run_training_step(&graph, 1)?;
    assert_eq!(graph.tensor(y[0]).to_vec()?, vec![9.0, 4.0]);
    assert_eq!(graph.tensor(x).grad_to_vec()?, vec![6.0, -4.0]);
    Ok(())
}
