use crate::{
    layer::{Layer, LayerKind, LayerSpec},
    layers::{
        activation::{Identity, Relu, Scale},
        dropout::Dropout,
        elementwise::Add,
        linear::InnerProduct,
        pooling::GlobalAverage,
    },
    losses::softmax::SoftmaxLoss,
};
use parallax_core::error::{Error, Result};
use std::collections::BTreeMap;

type Factory = Box<dyn Fn(serde_json::Value) -> Result<Box<dyn Layer>> + Send + Sync>;

struct Entry {
    spec: LayerSpec,
    factory: Factory,
}

/// Maps kind names to constructors taking JSON parameters.
///
/// New kinds are added with [`LayerRegistry::register`]; graphs and the
/// dispatcher only ever see `Box<dyn Layer>`.
#[derive(Default)]
pub struct LayerRegistry {
    entries: BTreeMap<&'static str, Entry>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register::<Identity>()
            .register::<Relu>()
            .register::<Scale>()
            .register::<Add>()
            .register::<InnerProduct>()
            .register::<GlobalAverage>()
            .register::<Dropout>()
            .register::<SoftmaxLoss>();
        registry
    }

    /// Registers `L` under `L::KIND`, replacing an earlier entry of the same name.
    pub fn register<L: LayerKind>(&mut self) -> &mut Self {
        let factory: Factory = Box::new(|value| {
            let value = if value.is_null() {
                serde_json::Value::Object(Default::default())
            } else {
                value
            };
            let params = match serde_json::from_value::<L::Params>(value.clone()) {
                Ok(params) => params,
                // unit params accept `null` / `{}`
                Err(e) => serde_json::from_value::<L::Params>(serde_json::Value::Null).map_err(|_| {
                    Error::Config(format!("invalid parameters for '{}': {}", L::KIND, e))
                })?,
            };
            Ok(Box::new(L::from_params(params)?) as Box<dyn Layer>)
        });

        if self.entries.contains_key(L::KIND) {
            log::warn!("layer kind '{}' registered twice, keeping the latest", L::KIND);
        }
        self.entries.insert(
            L::KIND,
            Entry {
                spec: LayerSpec::of::<L>(),
                factory,
            },
        );
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn spec(&self, kind: &str) -> Result<LayerSpec> {
        self.entries
            .get(kind)
            .map(|e| e.spec)
            .ok_or_else(|| Error::UnknownName(format!("layer kind '{}'", kind)))
    }

    pub fn create(&self, kind: &str, params: serde_json::Value) -> Result<(LayerSpec, Box<dyn Layer>)> {
        let entry = self
            .entries
            .get(kind)
            .ok_or_else(|| Error::UnknownName(format!("layer kind '{}'", kind)))?;
        Ok((entry.spec, (entry.factory)(params)?))
    }
}
