use crate::config::{Reduction, UpdateConfig};
use parallax_core::{
    error::{Error, Result},
    placement::Placement,
};
use parallax_cpu::{reduction, update};

/// Aggregation state held on the parameter-server placement: master weights,
/// momentum history and the most recent reduced gradient.
pub struct ParameterServer {
    placement: Placement,
    reduction: Reduction,
    update: UpdateConfig,
    weights: Vec<Vec<f32>>,
    history: Vec<Vec<f32>>,
    reduced: Vec<Vec<f32>>,
}

impl ParameterServer {
    pub fn new(placement: Placement, reduction: Reduction, update: UpdateConfig, weights: Vec<Vec<f32>>) -> Self {
        let zeros = || weights.iter().map(|w| vec![0.0; w.len()]).collect::<Vec<_>>();
        let history = zeros();
        let reduced = zeros();
        Self {
            placement,
            reduction,
            update,
            weights,
            history,
            reduced,
        }
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn weights(&self) -> &[Vec<f32>] {
        &self.weights
    }

    pub fn reduced(&self) -> &[Vec<f32>] {
        &self.reduced
    }

    pub fn set_weight(&mut self, index: usize, values: &[f32]) -> Result<()> {
        let slot = self
            .weights
            .get_mut(index)
            .ok_or_else(|| Error::InvalidArgument(format!("weight index {} out of range", index)))?;
        if slot.len() != values.len() {
            return Err(Error::Shape(format!(
                "weight {} holds {} values, got {}",
                index,
                slot.len(),
                values.len()
            )));
        }
        slot.copy_from_slice(values);
        Ok(())
    }

    /// Combines `grads[replica][weight]` in replica order and applies the
    /// update rule to the master weights.
    pub fn step(&mut self, grads: &[Vec<Vec<f32>>]) -> Result<()> {
        self.aggregate(grads)?;
        self.apply_update();
        Ok(())
    }

    pub fn aggregate(&mut self, grads: &[Vec<Vec<f32>>]) -> Result<()> {
        if grads.is_empty() {
            return Err(Error::InvalidArgument("no replica gradients to aggregate".into()));
        }
        for (r, replica) in grads.iter().enumerate() {
            if replica.len() != self.weights.len() {
                return Err(Error::Shape(format!(
                    "replica {} sent {} gradients for {} weights",
                    r,
                    replica.len(),
                    self.weights.len()
                )));
            }
            for (i, (g, w)) in replica.iter().zip(&self.weights).enumerate() {
                if g.len() != w.len() {
                    return Err(Error::Shape(format!(
                        "replica {} gradient {} has {} values, weight has {}",
                        r,
                        i,
                        g.len(),
                        w.len()
                    )));
                }
            }
        }

        let n = grads.len() as f32;
        for (i, out) in self.reduced.iter_mut().enumerate() {
            let sources: Vec<&[f32]> = grads.iter().map(|replica| replica[i].as_slice()).collect();
            reduction::ordered_sum(&sources, out);
            if self.reduction == Reduction::Mean {
                out.iter_mut().for_each(|v| *v /= n);
            }
        }
        Ok(())
    }

    pub fn apply_update(&mut self) {
        let UpdateConfig {
            learning_rate,
            momentum,
            weight_decay,
        } = self.update;
        for ((w, g), v) in self.weights.iter_mut().zip(&self.reduced).zip(self.history.iter_mut()) {
            update::sgd_momentum_update(w, g, v, learning_rate, momentum, weight_decay);
        }
    }
}
