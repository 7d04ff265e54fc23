use parallax_core::{
    error::{Error, Result},
    placement::Placement,
    shape::Shape,
    tensor::{Field, Tensor},
};
use parallax_dispatch::{Dispatcher, ExecutionTrace, RunMode};
use parallax_graph::{
    layers::activation::{Scale, ScaleParams},
    Graph, GraphBuilder, Layer, LayerContext, LayerKind,
};
use std::sync::Arc;

fn scale_chain(placement: Placement) -> Result<(Arc<Graph>, Vec<parallax_graph::TensorId>)> {
    let mut b = GraphBuilder::new(placement);
    let x = b.create("x", &[2])?;
    b.mark_input(x)?;
    let s1 = b.add_operator::<Scale>("s1", ScaleParams { factor: 2.0 })?;
    let s2 = b.add_operator::<Scale>("s2", ScaleParams { factor: 3.0 })?;
    let h = b.connect(&[x], s1)?;
    let y = b.connect(&h, s2)?;
    b.mark_loss(y[0])?;
    Ok((Arc::new(b.build()?), vec![x, h[0], y[0]]))
}

#[test]
fn forward_then_backward_in_order() -> Result<()> {
    let trace = Arc::new(ExecutionTrace::new());
    let dispatcher = Dispatcher::with_trace(0, trace.clone());
    let (graph, ids) = scale_chain(Placement::host(0))?;
    graph.tensor(ids[0]).set_value(&[1.0, -1.0])?;

    let handle = dispatcher.run_async(&graph, RunMode::Training, 1)?;
    dispatcher.sync(&handle)?;

    assert_eq!(graph.tensor(ids[2]).to_vec()?, vec![6.0, -6.0]);
    assert_eq!(graph.tensor(ids[0]).grad_to_vec()?, vec![6.0, 6.0]);

    assert!(trace.happened_before("rank0:host/prepare", "rank0:host/forward/s1"));
    assert!(trace.happened_before("rank0:host/forward/s1", "rank0:host/forward/s2"));
    assert!(trace.happened_before("rank0:host/forward/s2", "rank0:host/backward/s2"));
    assert!(trace.happened_before("rank0:host/backward/s2", "rank0:host/backward/s1"));
    Ok(())
}

#[test]
fn repeated_runs_reset_gradients() -> Result<()> {
    let dispatcher = Dispatcher::new(0);
    let (graph, ids) = scale_chain(Placement::host(0))?;
    graph.tensor(ids[0]).set_value(&[0.5, 0.25])?;

    for iteration in 1..=3 {
        let handle = dispatcher.run_async(&graph, RunMode::Training, iteration)?;
        dispatcher.sync(&handle)?;
        assert_eq!(graph.tensor(ids[0]).grad_to_vec()?, vec![6.0, 6.0]);
    }
    Ok(())
}

#[test]
fn inference_leaves_gradients_alone() -> Result<()> {
    let dispatcher = Dispatcher::new(0);
    let (graph, ids) = scale_chain(Placement::host(0))?;
    graph.tensor(ids[0]).set_value(&[1.0, 2.0])?;
    graph.tensor(ids[0]).set_grad(&[9.0, 9.0])?;

    dispatcher.sync(&dispatcher.run_async(&graph, RunMode::Inference, 1)?)?;
    assert_eq!(graph.tensor(ids[2]).to_vec()?, vec![6.0, 12.0]);
    assert_eq!(graph.tensor(ids[0]).grad_to_vec()?, vec![9.0, 9.0]);
    Ok(())
}

#[test]
fn fan_out_accumulates() -> Result<()> {
    let mut b = GraphBuilder::new(Placement::host(0));
    let x = b.create("x", &[2])?;
    let a = b.add_operator::<Scale>("a", ScaleParams { factor: 2.0 })?;
    let c = b.add_operator::<Scale>("c", ScaleParams { factor: -1.0 })?;
    let ya = b.connect(&[x], a)?;
    let yc = b.connect(&[x], c)?;
    b.mark_loss(ya[0])?;
    b.mark_loss(yc[0])?;
    let graph = Arc::new(b.build()?);

    let dispatcher = Dispatcher::new(0);
    dispatcher.sync(&dispatcher.run_async(&graph, RunMode::Training, 1)?)?;
    assert_eq!(graph.tensor(x).grad_to_vec()?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn graph_on_another_rank_is_rejected() -> Result<()> {
    let dispatcher = Dispatcher::new(0);
    let (graph, _) = scale_chain(Placement::host(1))?;
    assert!(matches!(
        dispatcher.run_async(&graph, RunMode::Training, 1),
        Err(Error::Placement(_))
    ));
    Ok(())
}

/// Fails its forward pass on purpose.
#[derive(Clone)]
struct Faulty;

impl Layer for Faulty {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        Ok(vec![inputs[0].to_vec()])
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        Err(ctx.compute_error("device fault"))
    }

    fn backward(&self, _ctx: &LayerContext<'_>) -> Result<()> {
        Ok(())
    }
}

impl LayerKind for Faulty {
    const KIND: &'static str = "faulty";
    const INPUTS: usize = 1;
    const OUTPUTS: usize = 1;
    type Params = ();

    fn from_params(_: ()) -> Result<Self> {
        Ok(Faulty)
    }
}

#[test]
fn failure_surfaces_at_sync() -> Result<()> {
    let mut b = GraphBuilder::new(Placement::host(0));
    let x = b.create("x", &[2])?;
    let bad = b.add_operator::<Faulty>("bad", ())?;
    let after = b.add_operator::<Scale>("after", ScaleParams { factor: 2.0 })?;
    let y = b.chain(&[x], &[bad, after])?;
    b.mark_loss(y[0])?;
    let graph = Arc::new(b.build()?);

    let dispatcher = Dispatcher::new(0);
    let handle = dispatcher.run_async(&graph, RunMode::Training, 1)?;
    match dispatcher.sync(&handle) {
        Err(Error::Compute { operator, message }) => {
            assert_eq!(operator, "bad");
            assert_eq!(message, "device fault");
        }
        other => panic!("unexpected {:?}", other),
    }
    let aborted = handle
        .events()
        .iter()
        .filter(|e| matches!(e.status(), Some(Err(Error::Aborted(_)))))
        .count();
    assert!(aborted >= 1);
    Ok(())
}

#[test]
fn transfers_stay_on_one_rank() -> Result<()> {
    let dispatcher = Dispatcher::new(0);
    let src = Arc::new(Tensor::new("src", &[3], Placement::device_of(0, 0))?);
    let dst = Arc::new(Tensor::new("dst", &[3], Placement::device_of(0, 1))?);
    src.set_grad(&[1.0, 2.0, 3.0])?;

    let event = dispatcher.transfer_async(src.clone(), dst.clone(), Field::Grad, vec![])?;
    event.wait()?;
    assert_eq!(dst.grad_to_vec()?, vec![1.0, 2.0, 3.0]);
    assert_eq!(dst.to_vec()?, vec![0.0; 3]);

    let remote = Arc::new(Tensor::new("remote", &[3], Placement::host(1))?);
    assert!(matches!(
        dispatcher.transfer_async(src, remote, Field::Value, vec![]),
        Err(Error::Placement(_))
    ));
    Ok(())
}

#[test]
fn cross_stream_dependency() -> Result<()> {
    let trace = Arc::new(ExecutionTrace::new());
    let dispatcher = Dispatcher::with_trace(0, trace.clone());
    let a = Placement::device_of(0, 0);
    let b = Placement::device_of(0, 1);

    let slow = dispatcher.submit(
        a,
        "slow",
        vec![],
        Box::new(|| {
            std::thread::sleep(std::time::Duration::from_millis(30));
            Ok(())
        }),
    )?;
    let waits = dispatcher.submit(b, "waits", vec![slow], Box::new(|| Ok(())))?;
    waits.wait()?;
    assert!(trace.happened_before("slow", "waits"));
    Ok(())
}
