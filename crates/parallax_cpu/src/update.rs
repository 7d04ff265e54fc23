use rayon::prelude::*;

/// SGD with momentum and L2 weight decay:
///
/// `v = momentum * v + lr * (g + weight_decay * w)`, then `w -= v`.
pub fn sgd_momentum_update(
    weight: &mut [f32],
    grad: &[f32],
    history: &mut [f32],
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
) {
    debug_assert_eq!(weight.len(), grad.len());
    debug_assert_eq!(weight.len(), history.len());

    weight
        .par_iter_mut()
        .zip(grad.par_iter().zip(history.par_iter_mut()))
        .for_each(|(w, (&g, v))| {
            *v = momentum * *v + learning_rate * (g + weight_decay * *w);
            *w -= *v;
        });
}
