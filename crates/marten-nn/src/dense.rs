// Dense — fully-connected layer, y = x·Wᵀ + b
//
// PARAMETER SHAPES:
//
//   weight: [out_features, in_features]
//   bias:   [out_features]                 (optional)
//
// Inputs are `[in]` or `[batch, in]`; a rank-1 input is handled as a batch
// of one and its gradient is returned rank-1 again.
//
// BACKWARD, given gradOut G [batch, out]:
//
//   dW = Gᵀ · x          summed over the batch by the product itself
//   db = Σ_batch G
//   dx = G · W

use marten_core::backend::{Backend, BinaryOp};
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::ops;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;
use marten_core::{BufferId, BufferRole};

use crate::init;
use crate::layer::{initialised, Layer, LayerBuffers};

#[derive(Clone, Copy)]
struct DenseBuffers {
    output: BufferId,
    input_grad: BufferId,
    weight_grad: BufferId,
    bias_grad: Option<BufferId>,
}

/// A fully-connected layer.
///
/// # Example
/// ```ignore
/// let mut fc = Dense::<CpuBackend>::new(784, 128, true, DType::F32, &CpuDevice)?;
/// fc.init(&Shape::from((32, 784)))?;
/// let y = fc.forward(&x)?;        // [32, 128]
/// let dx = fc.backward(&dy)?;     // [32, 784]
/// ```
pub struct Dense<B: Backend> {
    weight: Tensor<B>,
    bias: Option<Tensor<B>>,
    in_features: usize,
    out_features: usize,
    buffers: LayerBuffers<B>,
    ids: Option<DenseBuffers>,
    input: Option<Tensor<B>>,
}

impl<B: Backend> Dense<B> {
    /// A dense layer with Kaiming-uniform weights.
    pub fn new(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = Shape::from((out_features, in_features));
        let bias = if use_bias {
            Some(init::default_bias::<B>(&shape, out_features, dtype, device)?)
        } else {
            None
        };
        let weight = init::default_weight::<B>(shape, dtype, device)?;
        Self::from_tensors(weight, bias)
    }

    /// A dense layer around existing parameters.
    pub fn from_tensors(weight: Tensor<B>, bias: Option<Tensor<B>>) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(Error::RankMismatch {
                op: "dense",
                expected: 2,
                got: dims.len(),
            });
        }
        let (out_features, in_features) = (dims[0], dims[1]);
        if let Some(b) = &bias {
            if b.dims() != [out_features] {
                return Err(Error::ShapeMismatch {
                    op: "dense",
                    lhs: b.shape().clone(),
                    rhs: Shape::from(out_features),
                });
            }
        }
        Ok(Dense {
            weight,
            bias,
            in_features,
            out_features,
            buffers: LayerBuffers::new("dense"),
            ids: None,
            input: None,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }

    /// Rows of the batch matrix for an input shape.
    fn batch_of(&self, op: &'static str, input_shape: &Shape) -> Result<usize> {
        let dims = input_shape.dims();
        let (batch, features) = match dims {
            [f] => (1, *f),
            [b, f] => (*b, *f),
            _ => {
                return Err(Error::RankMismatch {
                    op,
                    expected: 2,
                    got: dims.len(),
                })
            }
        };
        if features != self.in_features {
            return Err(Error::ShapeMismatch {
                op,
                lhs: input_shape.clone(),
                rhs: self.weight.shape().clone(),
            });
        }
        Ok(batch)
    }
}

/// `t` as a `[batch, features]` matrix.
fn as_matrix<B: Backend>(t: &Tensor<B>) -> Result<Tensor<B>> {
    if t.rank() == 1 {
        t.unsqueeze(0)
    } else {
        Ok(t.clone())
    }
}

impl<B: Backend> Layer<B> for Dense<B> {
    fn name(&self) -> &str {
        "dense"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        let batch = self.batch_of("dense", input_shape)?;
        Ok(if input_shape.rank() == 1 {
            Shape::from(self.out_features)
        } else {
            Shape::from((batch, self.out_features))
        })
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let batch = self.batch_of("dense.init", input_shape)?;
        let output_shape = self.output_shape(input_shape)?;
        let (dtype, device) = (self.weight.dtype(), self.weight.device().clone());
        let has_bias = self.bias.is_some();
        let (n_in, n_out) = (self.in_features, self.out_features);
        self.ids = None;
        self.input = None;

        let arena = self.buffers.reopen();
        let ids = DenseBuffers {
            output: arena.alloc(BufferRole::Output, (batch, n_out), dtype, &device)?,
            input_grad: arena.alloc(BufferRole::InputGrad, (batch, n_in), dtype, &device)?,
            weight_grad: arena.alloc(BufferRole::WeightGrad, (n_out, n_in), dtype, &device)?,
            bias_grad: if has_bias {
                Some(arena.alloc(BufferRole::BiasGrad, n_out, dtype, &device)?)
            } else {
                None
            },
        };
        self.buffers.seal(input_shape, &output_shape);
        self.ids = Some(ids);
        Ok(())
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.buffers.check_input("dense.forward", x)?;
        let ids = initialised(&self.ids, "dense.forward")?;
        let x2 = as_matrix(x)?;
        let out = self.buffers.get(ids.output)?;
        ops::matmul_to(&out, &x2, &self.weight.t()?)?;
        if let Some(b) = &self.bias {
            ops::binary_assign(BinaryOp::Add, &out, b)?;
        }
        self.input = Some(x2);
        self.buffers.mark_forward();
        if x.rank() == 1 {
            out.reshape(self.out_features)
        } else {
            Ok(out)
        }
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "dense.backward";
        self.buffers.check_backward(op, grad_out)?;
        let ids = initialised(&self.ids, op)?;
        let x = self
            .input
            .as_ref()
            .ok_or_else(|| Error::missing_state(op, "no cached input"))?;
        let g = as_matrix(grad_out)?;

        ops::matmul_to(&self.buffers.get(ids.weight_grad)?, &g.t()?, x)?;
        if let Some(db) = ids.bias_grad {
            ops::sum_to(&self.buffers.get(db)?, &g, &[0], false)?;
        }
        let dx = self.buffers.get(ids.input_grad)?;
        ops::matmul_to(&dx, &g, &self.weight)?;
        if grad_out.rank() == 1 {
            dx.reshape(self.in_features)
        } else {
            Ok(dx)
        }
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut params = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            params.push(b.clone());
        }
        params
    }

    fn gradients(&self) -> Vec<Tensor<B>> {
        let Some(ids) = self.ids else {
            return Vec::new();
        };
        std::iter::once(ids.weight_grad)
            .chain(ids.bias_grad)
            .filter_map(|id| self.buffers.get(id).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::ErrorKind;
    use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};

    fn t(data: &[f64], shape: impl Into<Shape>) -> CpuTensor {
        CpuTensor::from_f64_slice(data, shape, DType::F64, &CpuDevice).unwrap()
    }

    fn layer() -> Dense<CpuBackend> {
        let w = t(&[1., 2., 3., 4., 5., 6.], (2, 3));
        let b = t(&[0.5, -0.5], 2);
        Dense::from_tensors(w, Some(b)).unwrap()
    }

    #[test]
    fn forward_and_backward() {
        let mut fc = layer();
        fc.init(&Shape::from((2, 3))).unwrap();
        let x = t(&[1., 0., 0., 0., 1., 1.], (2, 3));
        let y = fc.forward(&x).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![1.5, 3.5, 5.5, 10.5]);

        let g = t(&[1., 0., 0., 1.], (2, 2));
        let dx = fc.backward(&g).unwrap();
        assert_eq!(dx.to_f64_vec().unwrap(), vec![1., 2., 3., 4., 5., 6.]);
        let grads = fc.gradients();
        assert_eq!(grads[0].to_f64_vec().unwrap(), vec![1., 0., 0., 0., 1., 1.]);
        assert_eq!(grads[1].to_f64_vec().unwrap(), vec![1., 1.]);
    }

    #[test]
    fn single_sample_keeps_rank_one() {
        let mut fc = layer();
        fc.init(&Shape::from(3)).unwrap();
        let y = fc.forward(&t(&[1., 1., 1.], 3)).unwrap();
        assert_eq!(y.dims(), &[2]);
        let dx = fc.backward(&t(&[1., 1.], 2)).unwrap();
        assert_eq!(dx.to_f64_vec().unwrap(), vec![5., 7., 9.]);
    }

    #[test]
    fn lifecycle_errors() {
        let mut fc = layer();
        let x = t(&[0.; 3], (1, 3));
        assert_eq!(
            fc.forward(&x).unwrap_err().kind(),
            ErrorKind::MissingPrecomputedState
        );
        fc.init(&Shape::from((1, 3))).unwrap();
        let g = t(&[0.; 2], (1, 2));
        assert_eq!(
            fc.backward(&g).unwrap_err().kind(),
            ErrorKind::MissingPrecomputedState
        );
        let wrong = t(&[0.; 6], (2, 3));
        assert_eq!(fc.forward(&wrong).unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn new_initialises_within_bounds() {
        let fc = Dense::<CpuBackend>::new(16, 4, true, DType::F32, &CpuDevice).unwrap();
        let bound = 1.0 / 4.0;
        assert!(fc.weight().to_f64_vec().unwrap().iter().all(|w| w.abs() <= bound + 1e-6));
        assert_eq!(fc.num_parameters(), 16 * 4 + 4);
    }
}
