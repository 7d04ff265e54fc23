use crate::layer::{expect_inputs, Layer, LayerContext, LayerKind};
use parallax_core::{
    error::{Error, Result},
    shape::{self, Shape},
};
use parallax_cpu::matmul;
use serde::{Deserialize, Serialize};

fn default_bias() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InnerProductParams {
    pub num_output: usize,
    #[serde(default = "default_bias")]
    pub bias: bool,
}

impl InnerProductParams {
    pub fn new(num_output: usize) -> Self {
        Self { num_output, bias: true }
    }
}

/// Fully connected layer. Every input is flattened to `[N, K]` and mapped to
/// `[N, num_output]`. Creates `weight` of shape `[num_output, K]` and, unless
/// disabled, `bias` of shape `[num_output]`.
#[derive(LayerKind, Clone, Debug)]
#[layer(kind = "inner_product", params = InnerProductParams)]
pub struct InnerProduct {
    num_output: usize,
    bias: bool,
}

impl InnerProduct {
    pub fn new(params: InnerProductParams) -> Result<Self> {
        if params.num_output == 0 {
            return Err(Error::InvalidArgument("inner_product: num_output must be positive".into()));
        }
        Ok(Self {
            num_output: params.num_output,
            bias: params.bias,
        })
    }

    pub fn num_output(&self) -> usize {
        self.num_output
    }

    pub fn has_bias(&self) -> bool {
        self.bias
    }
}

impl Layer for InnerProduct {
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        expect_inputs(Self::KIND, inputs, 1)?;
        let (batch, _) = shape::flatten_batch(inputs[0])?;
        Ok(vec![vec![batch, self.num_output]])
    }

    fn param_shapes(&self, inputs: &[&[usize]]) -> Vec<(&'static str, Shape)> {
        let features = inputs.first().map(|s| shape::numel(&s[1.min(s.len())..])).unwrap_or(0);
        let mut params = vec![("weight", vec![self.num_output, features])];
        if self.bias {
            params.push(("bias", vec![self.num_output]));
        }
        params
    }

    fn forward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let (batch, features) = shape::flatten_batch(input.shape())?;
        let x = input.value()?;
        let w = ctx.param(0)?.value()?;
        let b = if self.bias { Some(ctx.param(1)?.value()?) } else { None };
        let mut y = ctx.output(0)?.value_mut()?;

        matmul::inner_product_forward(
            x.as_slice(),
            w.as_slice(),
            b.as_ref().map(|b| b.as_slice()),
            batch,
            features,
            self.num_output,
            y.as_mut_slice(),
        );
        Ok(())
    }

    fn backward(&self, ctx: &LayerContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let (batch, features) = shape::flatten_batch(input.shape())?;
        let dy = ctx.output(0)?.grad()?;

        {
            let w = ctx.param(0)?.value()?;
            let mut dx = input.grad_mut()?;
            matmul::inner_product_backward_input(dy.as_slice(), w.as_slice(), batch, features, self.num_output, dx.as_mut_slice());
        }
        {
            let x = input.value()?;
            let mut dw = ctx.param(0)?.grad_mut()?;
            matmul::inner_product_backward_weight(dy.as_slice(), x.as_slice(), batch, features, self.num_output, dw.as_mut_slice());
        }
        if self.bias {
            let mut db = ctx.param(1)?.grad_mut()?;
            matmul::inner_product_backward_bias(dy.as_slice(), batch, self.num_output, db.as_mut_slice());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallax_core::{placement::Placement, tensor::Tensor};
    use std::sync::Arc;

    #[test]
    fn param_shapes_follow_input() -> Result<()> {
        let ip = InnerProduct::new(InnerProductParams::new(10))?;
        assert_eq!(ip.infer_shapes(&[&[4, 3, 2, 2]])?, vec![vec![4, 10]]);
        assert_eq!(
            ip.param_shapes(&[&[4, 3, 2, 2]]),
            vec![("weight", vec![10, 12]), ("bias", vec![10])]
        );

        let no_bias = InnerProduct::new(InnerProductParams { num_output: 5, bias: false })?;
        assert_eq!(no_bias.param_shapes(&[&[1, 2]]).len(), 1);
        Ok(())
    }

    #[test]
    fn zero_outputs_rejected() {
        assert!(InnerProduct::new(InnerProductParams::new(0)).is_err());
    }

    #[test]
    fn forward_backward() -> Result<()> {
        let p = Placement::host(0);
        let x = Arc::new(Tensor::new("x", &[1, 2], p)?);
        let y = Arc::new(Tensor::new("y", &[1, 3], p)?);
        let w = Arc::new(Tensor::new("w", &[3, 2], p)?);
        let b = Arc::new(Tensor::new("b", &[3], p)?);
        x.set_value(&[1.0, 2.0])?;
        w.set_value(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0])?;
        b.set_value(&[0.0, 0.0, 1.0])?;

        let inputs = [x.clone()];
        let outputs = [y.clone()];
        let params = [w.clone(), b.clone()];
        let ctx = LayerContext {
            name: "fc",
            inputs: &inputs,
            outputs: &outputs,
            params: &params,
            training: true,
            iteration: 1,
        };

        let ip = InnerProduct::new(InnerProductParams::new(3))?;
        ip.forward(&ctx)?;
        assert_eq!(y.to_vec()?, vec![1.0, 2.0, 4.0]);

        y.set_grad(&[1.0, 1.0, 1.0])?;
        ip.backward(&ctx)?;
        assert_eq!(x.grad_to_vec()?, vec![2.0, 2.0]);
        assert_eq!(w.grad_to_vec()?, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert_eq!(b.grad_to_vec()?, vec![1.0, 1.0, 1.0]);
        Ok(())
    }
}
