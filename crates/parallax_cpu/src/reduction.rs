use rayon::prelude::*;

/// Averages every `[N, C, spatial]` plane down to `[N, C]`.
pub fn global_average_forward(input: &[f32], planes: usize, spatial: usize, output: &mut [f32]) {
    debug_assert_eq!(input.len(), planes * spatial);
    debug_assert_eq!(output.len(), planes);

    let inv = 1.0 / spatial as f32;
    output.par_iter_mut().enumerate().for_each(|(p, out)| {
        let plane = &input[p * spatial..(p + 1) * spatial];
        let mut acc = 0.0f32;
        for &v in plane {
            acc += v;
        }
        *out = acc * inv;
    });
}

pub fn global_average_backward(grad_output: &[f32], planes: usize, spatial: usize, grad_input: &mut [f32]) {
    debug_assert_eq!(grad_output.len(), planes);
    debug_assert_eq!(grad_input.len(), planes * spatial);

    let inv = 1.0 / spatial as f32;
    grad_input.par_chunks_mut(spatial).enumerate().for_each(|(p, plane)| {
        let g = grad_output[p] * inv;
        for v in plane.iter_mut() {
            *v += g;
        }
    });
}

/// Sums `sources` element-wise into `output` in slice order. The order of the
/// additions per element is fixed, which keeps reductions reproducible.
pub fn ordered_sum(sources: &[&[f32]], output: &mut [f32]) {
    output.par_iter_mut().enumerate().for_each(|(i, out)| {
        let mut acc = 0.0f32;
        for src in sources {
            acc += src[i];
        }
        *out = acc;
    });
}
