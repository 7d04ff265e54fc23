use rayon::prelude::*;

fn softmax_row(logits: &[f32], probs: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (p, &z) in probs.iter_mut().zip(logits) {
        *p = (z - max).exp();
        sum += *p;
    }
    for p in probs.iter_mut() {
        *p /= sum;
    }
}

/// Mean negative log-likelihood over the batch, scaled by `loss_weight`.
///
/// Labels are class indices stored as `f32`. Returns `None` when a label is
/// outside `[0, classes)`.
pub fn softmax_loss_forward(logits: &[f32], labels: &[f32], batch: usize, classes: usize, loss_weight: f32) -> Option<f32> {
    debug_assert_eq!(logits.len(), batch * classes);
    debug_assert_eq!(labels.len(), batch);

    let per_sample: Vec<Option<f32>> = (0..batch)
        .into_par_iter()
        .map(|n| {
            let label = labels[n];
            if label < 0.0 || label as usize >= classes || label.fract() != 0.0 {
                return None;
            }
            let mut probs = vec![0.0f32; classes];
            softmax_row(&logits[n * classes..(n + 1) * classes], &mut probs);
            Some(-probs[label as usize].max(f32::MIN_POSITIVE).ln())
        })
        .collect();

    let mut total = 0.0f32;
    for loss in per_sample {
        total += loss?;
    }
    Some(total / batch as f32 * loss_weight)
}

/// `dlogits += (softmax(logits) - onehot(label)) * loss_weight * upstream / batch`
pub fn softmax_loss_backward(
    logits: &[f32],
    labels: &[f32],
    batch: usize,
    classes: usize,
    loss_weight: f32,
    upstream: f32,
    grad_logits: &mut [f32],
) {
    debug_assert_eq!(grad_logits.len(), batch * classes);

    let scale = loss_weight * upstream / batch as f32;
    grad_logits.par_chunks_mut(classes).enumerate().for_each(|(n, row)| {
        let mut probs = vec![0.0f32; classes];
        softmax_row(&logits[n * classes..(n + 1) * classes], &mut probs);
        let label = labels[n] as usize;
        for (c, g) in row.iter_mut().enumerate() {
            let target = if c == label { 1.0 } else { 0.0 };
            *g += (probs[c] - target) * scale;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_logits() {
        let loss = softmax_loss_forward(&[0.0, 0.0, 0.0, 0.0], &[1.0, 0.0], 2, 2, 1.0);
        let loss = loss.expect("labels are valid");
        assert!((loss - 2.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn bad_label() {
        assert!(softmax_loss_forward(&[0.0, 0.0], &[2.0], 1, 2, 1.0).is_none());
    }

    #[test]
    fn gradient_sums_to_zero_per_row() {
        let logits = [1.0, 2.0, 3.0];
        let mut g = [0.0; 3];
        softmax_loss_backward(&logits, &[2.0], 1, 3, 1.0, 1.0, &mut g);
        let sum: f32 = g.iter().sum();
        assert!(sum.abs() < 1e-6);
        assert!(g[2] < 0.0);
    }
}
