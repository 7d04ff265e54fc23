use parallax_core::{
    error::{Error, Result},
    placement::{Placement, Topology},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path};

/// How replica gradients are combined on the parameter server. Either way the
/// sum runs in placement-list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    Sum,
    #[default]
    Mean,
}

/// `v = momentum * v + learning_rate * (g + weight_decay * w); w -= v`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.9,
            weight_decay: 0.0005,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// One replica per entry, in aggregation order.
    pub placements: Vec<Placement>,
    pub param_server: Placement,
    #[serde(default)]
    pub reduction: Reduction,
    #[serde(default)]
    pub update: UpdateConfig,
    /// Seeds weight initialization.
    #[serde(default)]
    pub seed: u64,
    /// When set, device indices are checked against it.
    #[serde(default)]
    pub devices_per_rank: Option<usize>,
}

impl ParallelConfig {
    pub fn new(placements: Vec<Placement>, param_server: Placement) -> Self {
        Self {
            placements,
            param_server,
            reduction: Reduction::default(),
            update: UpdateConfig::default(),
            seed: 0,
            devices_per_rank: None,
        }
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_update(mut self, update: UpdateConfig) -> Self {
        self.update = update;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self, world_size: usize) -> Result<()> {
        if self.placements.is_empty() {
            return Err(Error::Config("at least one replica placement is required".into()));
        }
        let mut seen = HashSet::new();
        for p in &self.placements {
            if !seen.insert(*p) {
                return Err(Error::Config(format!("placement {} listed twice", p)));
            }
        }

        let topology = Topology::new(world_size, self.devices_per_rank.unwrap_or(usize::MAX));
        for p in self.placements.iter().chain(std::iter::once(&self.param_server)) {
            topology.validate(p)?;
        }
        Ok(())
    }

    /// Ranks other than the parameter server's that host at least one replica.
    pub fn remote_replica_ranks(&self) -> Vec<usize> {
        let mut ranks: Vec<usize> = self
            .placements
            .iter()
            .map(|p| p.rank())
            .filter(|&r| r != self.param_server.rank())
            .collect();
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_defaults() -> Result<()> {
        let config = ParallelConfig::from_json_str(
            r#"{
                "placements": [{ "rank": 0, "device": 0 }, { "rank": 0, "device": 1 }],
                "param_server": { "rank": 0, "device": -1 }
            }"#,
        )?;
        assert_eq!(config.reduction, Reduction::Mean);
        assert_eq!(config.update, UpdateConfig::default());
        assert!(config.param_server.is_host());
        config.validate(1)
    }

    #[test]
    fn rejects_bad_topologies() {
        let dup = ParallelConfig::new(vec![Placement::host(0), Placement::host(0)], Placement::host(0));
        assert!(matches!(dup.validate(1), Err(Error::Config(_))));

        let far = ParallelConfig::new(vec![Placement::device_of(2, 0)], Placement::host(0));
        assert!(matches!(far.validate(2), Err(Error::Placement(_))));

        let mut narrow = ParallelConfig::new(vec![Placement::device_of(0, 3)], Placement::host(0));
        narrow.devices_per_rank = Some(2);
        assert!(matches!(narrow.validate(1), Err(Error::Placement(_))));
    }

    #[test]
    fn remote_ranks() {
        let config = ParallelConfig::new(
            vec![
                Placement::device_of(1, 0),
                Placement::device_of(0, 0),
                Placement::device_of(1, 1),
                Placement::device_of(2, 0),
            ],
            Placement::host(0),
        );
        assert_eq!(config.remote_replica_ranks(), vec![1, 2]);
    }
}
