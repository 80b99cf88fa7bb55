// Dropout — random zeroing during training
//
//   training:   u ~ U[0, 1)    m = (u >= p)    y = x * m / (1 - p)
//   inference:  y = x
//
//   backward:   dx = g * m / (1 - p)   (or dx = g if forward ran in inference)
//
// The mask is drawn into a scratch buffer on every training forward and
// kept as U8 for the backward pass. A layer starts in inference mode; call
// `set_training(true)` (directly or through a Sequential) to enable it.
// Backward follows the mode that was active when forward ran.

use marten_core::backend::{Backend, CmpOp};
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::ops;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;
use marten_core::{BufferId, BufferRole};

use crate::layer::{initialised, Layer, LayerBuffers};

#[derive(Clone, Copy)]
struct DropoutBuffers {
    output: BufferId,
    input_grad: BufferId,
    uniform: BufferId,
    mask: BufferId,
}

/// Zeroes each element with probability `p` while training and rescales
/// the survivors by `1 / (1 - p)`.
pub struct Dropout<B: Backend> {
    p: f64,
    training: bool,
    masked: bool,
    dtype: DType,
    device: B::Device,
    buffers: LayerBuffers<B>,
    ids: Option<DropoutBuffers>,
}

impl<B: Backend> Dropout<B> {
    /// `p` must lie in `[0, 1)`.
    pub fn new(p: f64, dtype: DType, device: &B::Device) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::unsupported(
                "dropout",
                format!("drop probability {p} is outside [0, 1)"),
            ));
        }
        Ok(Dropout {
            p,
            training: false,
            masked: false,
            dtype,
            device: device.clone(),
            buffers: LayerBuffers::new("dropout"),
            ids: None,
        })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    fn scale(&self) -> f64 {
        1.0 / (1.0 - self.p)
    }
}

impl<B: Backend> Layer<B> for Dropout<B> {
    fn name(&self) -> &str {
        "dropout"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        Ok(input_shape.clone())
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        self.ids = None;
        self.masked = false;
        let (dtype, device) = (self.dtype, self.device.clone());
        let arena = self.buffers.reopen();
        let ids = DropoutBuffers {
            output: arena.alloc(BufferRole::Output, input_shape, dtype, &device)?,
            input_grad: arena.alloc(BufferRole::InputGrad, input_shape, dtype, &device)?,
            uniform: arena.alloc(BufferRole::Scratch("uniform"), input_shape, dtype, &device)?,
            mask: arena.alloc(BufferRole::Scratch("mask"), input_shape, DType::U8, &device)?,
        };
        self.buffers.seal(input_shape, input_shape);
        self.ids = Some(ids);
        Ok(())
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "dropout.forward";
        self.buffers.check_input(op, x)?;
        let ids = initialised(&self.ids, op)?;
        let out = self.buffers.get(ids.output)?;
        self.masked = self.training && self.p > 0.0;
        if self.masked {
            let u = self.buffers.get(ids.uniform)?;
            let mask = self.buffers.get(ids.mask)?;
            ops::fill_uniform(&u)?;
            ops::cmp_scalar_to(CmpOp::Ge, &mask, &u, self.p)?;
            ops::relu_grad_masked_to(&out, x, &mask)?;
            ops::affine_to(&out, &out, self.scale(), 0.0)?;
        } else {
            ops::copy_to(&out, x)?;
        }
        self.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "dropout.backward";
        self.buffers.check_backward(op, grad_out)?;
        let ids = initialised(&self.ids, op)?;
        let dx = self.buffers.get(ids.input_grad)?;
        if self.masked {
            let mask = self.buffers.get(ids.mask)?;
            ops::relu_grad_masked_to(&dx, grad_out, &mask)?;
            ops::affine_to(&dx, &dx, self.scale(), 0.0)?;
        } else {
            ops::copy_to(&dx, grad_out)?;
        }
        Ok(dx)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::ErrorKind;
    use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};

    fn ones(shape: impl Into<Shape>) -> CpuTensor {
        CpuTensor::ones(shape, DType::F64, &CpuDevice).unwrap()
    }

    #[test]
    fn inference_is_identity() {
        let mut d = Dropout::<CpuBackend>::new(0.5, DType::F64, &CpuDevice).unwrap();
        assert!(!d.is_training());
        d.init(&Shape::from((4, 8))).unwrap();
        let x = CpuTensor::randn((4, 8), DType::F64, &CpuDevice).unwrap();
        let y = d.forward(&x).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), x.to_f64_vec().unwrap());
        let dx = d.backward(&x).unwrap();
        assert_eq!(dx.to_f64_vec().unwrap(), x.to_f64_vec().unwrap());
    }

    #[test]
    fn training_zeroes_or_rescales() {
        let mut d = Dropout::<CpuBackend>::new(0.5, DType::F64, &CpuDevice).unwrap();
        d.set_training(true);
        d.init(&Shape::from((40, 100))).unwrap();
        let y = d.forward(&ones((40, 100))).unwrap().to_f64_vec().unwrap();
        assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
        let dropped = y.iter().filter(|&&v| v == 0.0).count() as f64 / y.len() as f64;
        assert!((0.4..0.6).contains(&dropped), "dropped fraction {dropped}");

        // the gradient passes exactly where the forward value did
        let dx = d.backward(&ones((40, 100))).unwrap().to_f64_vec().unwrap();
        assert_eq!(dx, y);
    }

    #[test]
    fn backward_uses_the_mode_of_its_forward() {
        let mut d = Dropout::<CpuBackend>::new(0.25, DType::F64, &CpuDevice).unwrap();
        d.init(&Shape::from(64)).unwrap();
        d.set_training(true);
        let y = d.forward(&ones(64)).unwrap().to_f64_vec().unwrap();
        d.set_training(false);
        let dx = d.backward(&ones(64)).unwrap().to_f64_vec().unwrap();
        assert_eq!(dx, y);
    }

    #[test]
    fn zero_probability_keeps_everything() {
        let mut d = Dropout::<CpuBackend>::new(0.0, DType::F64, &CpuDevice).unwrap();
        d.set_training(true);
        d.init(&Shape::from(16)).unwrap();
        let y = d.forward(&ones(16)).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![1.0; 16]);
    }

    #[test]
    fn probability_must_be_below_one() {
        for p in [1.0, -0.1, f64::NAN] {
            let err = Dropout::<CpuBackend>::new(p, DType::F64, &CpuDevice).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::UnsupportedConfiguration);
        }
    }
}
