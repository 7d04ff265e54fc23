use paste::paste;
use rayon::prelude::*;

macro_rules! unary_op {
    ($name:ident, |$x:ident| $forward:expr, |$xb:ident, $dy:ident| $backward:expr) => {
        paste! {
            pub fn [<$name _forward>](input: &[f32], output: &mut [f32]) {
                debug_assert_eq!(input.len(), output.len());
                output.par_iter_mut().zip(input.par_iter()).for_each(|(out, &$x)| {
                    *out = $forward;
                });
            }

            pub fn [<$name _backward>](input: &[f32], grad_output: &[f32], grad_input: &mut [f32]) {
                debug_assert_eq!(input.len(), grad_input.len());
                debug_assert_eq!(grad_output.len(), grad_input.len());
                grad_input
                    .par_iter_mut()
                    .zip(input.par_iter().zip(grad_output.par_iter()))
                    .for_each(|(g, (&$xb, &$dy))| {
                        *g += $backward;
                    });
            }
        }
    };
}

unary_op!(identity, |x| x, |_x, dy| dy);
unary_op!(relu, |x| if x > 0.0 { x } else { 0.0 }, |x, dy| if x > 0.0 { dy } else { 0.0 });

macro_rules! scaled_op {
    ($name:ident, |$x:ident, $alpha:ident| $forward:expr) => {
        paste! {
            pub fn [<$name _forward>](input: &[f32], $alpha: f32, output: &mut [f32]) {
                debug_assert_eq!(input.len(), output.len());
                output.par_iter_mut().zip(input.par_iter()).for_each(|(out, &$x)| {
                    *out = $forward;
                });
            }

            pub fn [<$name _backward>](grad_output: &[f32], $alpha: f32, grad_input: &mut [f32]) {
                debug_assert_eq!(grad_output.len(), grad_input.len());
                grad_input.par_iter_mut().zip(grad_output.par_iter()).for_each(|(g, &$x)| {
                    *g += $forward;
                });
            }
        }
    };
}

scaled_op!(scale, |x, alpha| x * alpha);

pub fn copy(src: &[f32], dst: &mut [f32]) {
    dst.copy_from_slice(src);
}

/// `y += x`
pub fn accumulate(x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    y.par_iter_mut().zip(x.par_iter()).for_each(|(y, &x)| *y += x);
}

/// `y += alpha * x`
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    y.par_iter_mut().zip(x.par_iter()).for_each(|(y, &x)| *y += alpha * x);
}

pub fn add_forward(a: &[f32], b: &[f32], output: &mut [f32]) {
    debug_assert_eq!(a.len(), output.len());
    debug_assert_eq!(b.len(), output.len());
    output
        .par_iter_mut()
        .zip(a.par_iter().zip(b.par_iter()))
        .for_each(|(out, (&a, &b))| *out = a + b);
}

pub fn mask_forward(input: &[f32], mask: &[f32], output: &mut [f32]) {
    debug_assert_eq!(input.len(), mask.len());
    output
        .par_iter_mut()
        .zip(input.par_iter().zip(mask.par_iter()))
        .for_each(|(out, (&x, &m))| *out = x * m);
}

pub fn mask_backward(grad_output: &[f32], mask: &[f32], grad_input: &mut [f32]) {
    debug_assert_eq!(grad_output.len(), mask.len());
    grad_input
        .par_iter_mut()
        .zip(grad_output.par_iter().zip(mask.par_iter()))
        .for_each(|(g, (&dy, &m))| *g += dy * m);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu() {
        let x = [-1.0, 0.0, 2.0, 3.0];
        let mut y = [0.0; 4];
        relu_forward(&x, &mut y);
        assert_eq!(y, [0.0, 0.0, 2.0, 3.0]);

        let mut dx = [1.0; 4];
        relu_backward(&x, &[1.0, 1.0, 1.0, 1.0], &mut dx);
        assert_eq!(dx, [1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn scale() {
        let mut y = [0.0; 3];
        scale_forward(&[1.0, 2.0, 3.0], 2.0, &mut y);
        assert_eq!(y, [2.0, 4.0, 6.0]);

        let mut dx = [0.0; 3];
        scale_backward(&[1.0, 1.0, 1.0], 0.5, &mut dx);
        assert_eq!(dx, [0.5, 0.5, 0.5]);
    }

    #[test]
    fn axpy_and_accumulate() {
        let mut y = [1.0, 1.0];
        axpy(2.0, &[1.0, 3.0], &mut y);
        assert_eq!(y, [3.0, 7.0]);
        accumulate(&[1.0, 1.0], &mut y);
        assert_eq!(y, [4.0, 8.0]);
    }
}
