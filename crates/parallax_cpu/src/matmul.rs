use rayon::prelude::*;

/// `y[n, m] = sum_k x[n, k] * w[m, k] + b[m]`
pub fn inner_product_forward(
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    batch: usize,
    in_features: usize,
    out_features: usize,
    output: &mut [f32],
) {
    debug_assert_eq!(input.len(), batch * in_features);
    debug_assert_eq!(weight.len(), out_features * in_features);
    debug_assert_eq!(output.len(), batch * out_features);

    output.par_chunks_mut(out_features).enumerate().for_each(|(n, row)| {
        let x = &input[n * in_features..(n + 1) * in_features];
        for (m, out) in row.iter_mut().enumerate() {
            let w = &weight[m * in_features..(m + 1) * in_features];
            let mut acc = 0.0f32;
            for k in 0..in_features {
                acc += x[k] * w[k];
            }
            if let Some(b) = bias {
                acc += b[m];
            }
            *out = acc;
        }
    });
}

/// `dx[n, k] += sum_m dy[n, m] * w[m, k]`
pub fn inner_product_backward_input(
    grad_output: &[f32],
    weight: &[f32],
    batch: usize,
    in_features: usize,
    out_features: usize,
    grad_input: &mut [f32],
) {
    debug_assert_eq!(grad_input.len(), batch * in_features);

    grad_input.par_chunks_mut(in_features).enumerate().for_each(|(n, row)| {
        let dy = &grad_output[n * out_features..(n + 1) * out_features];
        for (k, g) in row.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for m in 0..out_features {
                acc += dy[m] * weight[m * in_features + k];
            }
            *g += acc;
        }
    });
}

/// `dw[m, k] += sum_n dy[n, m] * x[n, k]`
pub fn inner_product_backward_weight(
    grad_output: &[f32],
    input: &[f32],
    batch: usize,
    in_features: usize,
    out_features: usize,
    grad_weight: &mut [f32],
) {
    debug_assert_eq!(grad_weight.len(), out_features * in_features);

    grad_weight.par_chunks_mut(in_features).enumerate().for_each(|(m, row)| {
        for (k, g) in row.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for n in 0..batch {
                acc += grad_output[n * out_features + m] * input[n * in_features + k];
            }
            *g += acc;
        }
    });
}

/// `db[m] += sum_n dy[n, m]`
pub fn inner_product_backward_bias(grad_output: &[f32], batch: usize, out_features: usize, grad_bias: &mut [f32]) {
    debug_assert_eq!(grad_bias.len(), out_features);

    grad_bias.par_iter_mut().enumerate().for_each(|(m, g)| {
        let mut acc = 0.0f32;
        for n in 0..batch {
            acc += grad_output[n * out_features + m];
        }
        *g += acc;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    // x = [[1, 2]], w = [[1, 0], [0, 1], [1, 1]], b = [0, 0, 1]
    #[test]
    fn forward() {
        let mut y = [0.0; 3];
        inner_product_forward(
            &[1.0, 2.0],
            &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            Some(&[0.0, 0.0, 1.0]),
            1,
            2,
            3,
            &mut y,
        );
        assert_eq!(y, [1.0, 2.0, 4.0]);
    }

    #[test]
    fn backward() {
        let x = [1.0, 2.0];
        let w = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let dy = [1.0, 1.0, 1.0];

        let mut dx = [0.0; 2];
        inner_product_backward_input(&dy, &w, 1, 2, 3, &mut dx);
        assert_eq!(dx, [2.0, 2.0]);

        let mut dw = [0.0; 6];
        inner_product_backward_weight(&dy, &x, 1, 2, 3, &mut dw);
        assert_eq!(dw, [1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);

        let mut db = [1.0; 3];
        inner_product_backward_bias(&dy, 1, 3, &mut db);
        assert_eq!(db, [2.0, 2.0, 2.0]);
    }
}
