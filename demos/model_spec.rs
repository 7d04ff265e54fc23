use parallax::prelude::*;

const MODEL: &str = r#"{
    "inputs": [
        { "name": "data", "shape": [4, 6] },
        { "name": "label", "shape": [4] }
    ],
    "operators": [
        { "name": "fc1", "kind": "inner_product", "params": { "num_output": 8 }, "inputs": ["data"] },
        { "name": "relu", "kind": "relu", "inputs": ["fc1.out"] },
        { "name": "fc2", "kind": "inner_product", "params": { "num_output": 3 }, "inputs": ["relu.out"] },
        { "name": "loss", "kind": "softmax_loss", "inputs": ["fc2.out", "label"] }
    ],
    "losses": ["loss.out"]
}"#;

fn main() -> Result<()> {
    let spec = ModelSpec::from_json_str(MODEL)?;
    let registry = LayerRegistry::with_builtin();
    let graph = std::sync::Arc::new(spec.build(Placement::host(0), &registry)?);
    print!("{}", graph.summary());
    println!("weights: {:?}", graph.weight_keys());

    let data: Vec<f32> = (0..24).map(|i| (i as f32 * 0.3).cos()).collect();
    graph.tensor_by_name("data")?.set_value(&data)?;
    graph.tensor_by_name("label")?.set_value(&[0.0, 1.0, 2.0, 1.0])?;
    for (i, key) in graph.weight_keys().iter().enumerate() {
        if key.ends_with(".weight") {
            let w = graph.weight(i)?;
            let values: Vec<f32> = (0..w.size()).map(|j| ((j * 7 % 11) as f32 - 5.0) * 0.02).collect();
            w.set_value(&values)?;
        }
    }

    let dispatcher = Dispatcher::new(0);
    for iteration in 0..5 {
        let handle = dispatcher.run_async(&graph, RunMode::Training, iteration)?;
        dispatcher.sync(&handle)?;
        println!("iteration {}: loss {:?}", iteration, graph.tensor_by_name("loss.out")?.to_vec()?);

        for i in 0..graph.num_weights() {
            let w = graph.weight(i)?;
            let g = w.grad_to_vec()?;
            let mut value = w.value_mut()?;
            parallax::cpu::ops::axpy(-0.5, &g, value.as_mut_slice());
        }
    }
    Ok(())
}
