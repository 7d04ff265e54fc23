use crate::{
    graph::{Graph, GraphBuilder},
    registry::LayerRegistry,
};
use parallax_core::{
    error::{Error, Result},
    placement::Placement,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorSpec {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub inputs: Vec<String>,
}

/// A graph described as data. Operators are connected in the listed order and
/// their outputs are referenced as `{name}.out` (or `{name}.out{i}`).
///
/// ```json
/// {
///   "inputs": [{ "name": "data", "shape": [8, 4] }, { "name": "label", "shape": [8] }],
///   "operators": [
///     { "name": "fc", "kind": "inner_product", "params": { "num_output": 3 }, "inputs": ["data"] },
///     { "name": "loss", "kind": "softmax_loss", "inputs": ["fc.out", "label"] }
///   ],
///   "losses": ["loss.out"]
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelSpec {
    pub inputs: Vec<InputSpec>,
    pub operators: Vec<OperatorSpec>,
    #[serde(default)]
    pub losses: Vec<String>,
}

impl ModelSpec {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Declares everything into an existing builder.
    pub fn declare(&self, builder: &mut GraphBuilder, registry: &LayerRegistry) -> Result<()> {
        for input in &self.inputs {
            let id = builder.create(&input.name, &input.shape)?;
            builder.mark_input(id)?;
        }
        for op in &self.operators {
            let id = builder.add_operator_by_kind(&op.name, &op.kind, op.params.clone(), registry)?;
            let inputs = op
                .inputs
                .iter()
                .map(|name| builder.tensor_id(name))
                .collect::<Result<Vec<_>>>()?;
            builder.connect(&inputs, id)?;
        }
        for loss in &self.losses {
            let id = builder.tensor_id(loss)?;
            builder.mark_loss(id)?;
        }
        Ok(())
    }

    pub fn build(&self, placement: Placement, registry: &LayerRegistry) -> Result<Graph> {
        let mut builder = GraphBuilder::new(placement);
        self.declare(&mut builder, registry)?;
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MLP: &str = r#"{
        "inputs": [{ "name": "data", "shape": [8, 4] }, { "name": "label", "shape": [8] }],
        "operators": [
            { "name": "fc1", "kind": "inner_product", "params": { "num_output": 6 }, "inputs": ["data"] },
            { "name": "act", "kind": "relu", "inputs": ["fc1.out"] },
            { "name": "fc2", "kind": "inner_product", "params": { "num_output": 3, "bias": false }, "inputs": ["act.out"] },
            { "name": "loss", "kind": "softmax_loss", "inputs": ["fc2.out", "label"] }
        ],
        "losses": ["loss.out"]
    }"#;

    #[test]
    fn builds_from_json() -> Result<()> {
        let spec = ModelSpec::from_json_str(MLP)?;
        let graph = spec.build(Placement::host(0), &LayerRegistry::with_builtin())?;
        assert_eq!(graph.weight_keys(), vec!["fc1.weight", "fc1.bias", "fc2.weight"]);
        assert_eq!(graph.inputs().len(), 2);
        assert_eq!(graph.losses().len(), 1);
        assert_eq!(graph.weight(2)?.shape(), &[3, 6]);
        Ok(())
    }

    #[test]
    fn unknown_tensor_reference() -> Result<()> {
        let mut spec = ModelSpec::from_json_str(MLP)?;
        spec.operators[1].inputs = vec!["fc9.out".into()];
        let err = spec.build(Placement::host(0), &LayerRegistry::with_builtin());
        assert!(matches!(err, Err(Error::UnknownName(_))));
        Ok(())
    }
}
