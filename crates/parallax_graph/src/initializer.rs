use parallax_core::error::{Error, Result};
use rand::{rngs::StdRng, Rng};
use rand_distr::{Distribution, Normal};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Fills a weight buffer.
pub trait Initializer: Send + Sync {
    fn fill(&self, values: &mut [f32], rng: &mut StdRng) -> Result<()>;
}

pub trait InitializerKind: Initializer + Sized + 'static {
    const KIND: &'static str;
    type Params: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn from_params(params: Self::Params) -> Result<Self>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantParams {
    pub value: f32,
}

#[derive(Clone, Debug)]
pub struct Constant {
    value: f32,
}

impl Initializer for Constant {
    fn fill(&self, values: &mut [f32], _rng: &mut StdRng) -> Result<()> {
        values.fill(self.value);
        Ok(())
    }
}

impl InitializerKind for Constant {
    const KIND: &'static str = "constant";
    type Params = ConstantParams;

    fn from_params(params: ConstantParams) -> Result<Self> {
        Ok(Self { value: params.value })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GaussianParams {
    #[serde(default)]
    pub mean: f32,
    pub std: f32,
}

#[derive(Clone, Debug)]
pub struct Gaussian {
    normal: Normal<f32>,
}

impl Initializer for Gaussian {
    fn fill(&self, values: &mut [f32], rng: &mut StdRng) -> Result<()> {
        for v in values.iter_mut() {
            *v = self.normal.sample(rng);
        }
        Ok(())
    }
}

impl InitializerKind for Gaussian {
    const KIND: &'static str = "gaussian";
    type Params = GaussianParams;

    fn from_params(params: GaussianParams) -> Result<Self> {
        if !(params.std >= 0.0 && params.std.is_finite()) {
            return Err(Error::InvalidArgument(format!(
                "gaussian std must be finite and non-negative, got {}",
                params.std
            )));
        }
        let normal = Normal::new(params.mean, params.std)
            .map_err(|e| Error::InvalidArgument(format!("gaussian({}, {}): {}", params.mean, params.std, e)))?;
        Ok(Self { normal })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UniformParams {
    pub low: f32,
    pub high: f32,
}

#[derive(Clone, Debug)]
pub struct Uniform {
    low: f32,
    high: f32,
}

impl Initializer for Uniform {
    fn fill(&self, values: &mut [f32], rng: &mut StdRng) -> Result<()> {
        for v in values.iter_mut() {
            *v = rng.gen_range(self.low..self.high);
        }
        Ok(())
    }
}

impl InitializerKind for Uniform {
    const KIND: &'static str = "uniform";
    type Params = UniformParams;

    fn from_params(params: UniformParams) -> Result<Self> {
        if !(params.low < params.high) {
            return Err(Error::InvalidArgument(format!(
                "uniform: low ({}) must be below high ({})",
                params.low, params.high
            )));
        }
        Ok(Self {
            low: params.low,
            high: params.high,
        })
    }
}

type Factory = Box<dyn Fn(serde_json::Value) -> Result<Box<dyn Initializer>> + Send + Sync>;

/// Initializers by name, for configuration-driven setups.
#[derive(Default)]
pub struct InitializerRegistry {
    factories: BTreeMap<&'static str, Factory>,
}

impl InitializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register::<Constant>().register::<Gaussian>().register::<Uniform>();
        registry
    }

    pub fn register<I: InitializerKind>(&mut self) -> &mut Self {
        self.factories.insert(
            I::KIND,
            Box::new(|value| {
                let params: I::Params = serde_json::from_value(value)
                    .map_err(|e| Error::Config(format!("invalid parameters for '{}': {}", I::KIND, e)))?;
                Ok(Box::new(I::from_params(params)?) as Box<dyn Initializer>)
            }),
        );
        self
    }

    pub fn create(&self, kind: &str, params: serde_json::Value) -> Result<Box<dyn Initializer>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| Error::UnknownName(format!("initializer '{}'", kind)))?;
        factory(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use serde_json::json;

    #[test]
    fn constant_and_uniform() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut v = [0.0; 8];
        Constant::from_params(ConstantParams { value: 0.2 })?.fill(&mut v, &mut rng)?;
        assert!(v.iter().all(|&x| x == 0.2));

        Uniform::from_params(UniformParams { low: -1.0, high: 1.0 })?.fill(&mut v, &mut rng)?;
        assert!(v.iter().all(|&x| (-1.0..1.0).contains(&x)));
        assert!(Uniform::from_params(UniformParams { low: 1.0, high: 1.0 }).is_err());
        Ok(())
    }

    #[test]
    fn gaussian_is_seeded() -> Result<()> {
        let g = Gaussian::from_params(GaussianParams { mean: 0.0, std: 0.01 })?;
        let mut a = [0.0; 16];
        let mut b = [0.0; 16];
        g.fill(&mut a, &mut StdRng::seed_from_u64(42))?;
        g.fill(&mut b, &mut StdRng::seed_from_u64(42))?;
        assert_eq!(a, b);
        assert!(matches!(
            Gaussian::from_params(GaussianParams { mean: 0.0, std: -1.0 }),
            Err(Error::InvalidArgument(_))
        ));
        assert!(Gaussian::from_params(GaussianParams { mean: 0.0, std: f32::NAN }).is_err());
        assert!(Gaussian::from_params(GaussianParams { mean: 0.0, std: 0.0 }).is_ok());
        Ok(())
    }

    #[test]
    fn registry() -> Result<()> {
        let registry = InitializerRegistry::with_builtin();
        let init = registry.create("gaussian", json!({ "std": 0.1 }))?;
        let mut v = [0.0; 4];
        init.fill(&mut v, &mut StdRng::seed_from_u64(1))?;
        assert!(registry.create("xavier", json!({})).is_err());
        Ok(())
    }
}
