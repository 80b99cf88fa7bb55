// Lstm — a single LSTM cell stepped over batches of inputs
//
// PARAMETERS (gate order i, f, g, o along the 4H axis):
//
//   w_ih: [4H, I]    w_hh: [4H, H]    bias: [4H]
//
// FORWARD, with state (h, c) carried between calls:
//
//   gates = x·w_ihᵀ + h·w_hhᵀ + bias              [N, 4H]
//   i, f, o = σ(gates_i, gates_f, gates_o)        g = tanh(gates_g)
//   c' = f*c + i*g
//   h' = o * tanh(c')
//
// BACKWARD covers the most recent step only (truncated at one step). Given
// dh' and with dc' = 0 from the future:
//
//   dc      = dh' * o * (1 - tanh²(c'))
//   d(o)    = σ'(dh' * tanh(c'))       d(i) = σ'(dc * g)
//   d(f)    = σ'(dc * c)               d(g) = tanh'(dc * i)
//   dgates  = [d(i), d(f), d(g), d(o)]
//   dw_ih   = dgatesᵀ·x     dw_hh = dgatesᵀ·h     dbias = Σ_batch dgates
//   dx      = dgates·w_ih   dh    = dgates·w_hh   dc_prev = dc * f
//
// Every derivative through σ and tanh goes through the fused kernels, with
// the cached activations as their auxiliary operand.

use marten_core::backend::{Backend, BinaryOp, UnaryOp};
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::ops;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;
use marten_core::{BufferId, BufferRole};

use crate::init;
use crate::layer::{expect_rank, initialised, Layer, LayerBuffers};

#[derive(Clone, Copy)]
struct LstmBuffers {
    output: BufferId,
    input_grad: BufferId,
    w_ih_grad: BufferId,
    w_hh_grad: BufferId,
    bias_grad: BufferId,
    h_prev_grad: BufferId,
    c_prev_grad: BufferId,
    h: BufferId,
    c: BufferId,
    h_prev: BufferId,
    c_prev: BufferId,
    gates: BufferId,
    acts: BufferId,
    tanh_c: BufferId,
    ig: BufferId,
    dc: BufferId,
    dgates: BufferId,
}

/// Gate `k` (0 = i, 1 = f, 2 = g, 3 = o) of a `[N, 4H]` tensor.
fn gate<B: Backend>(t: &Tensor<B>, k: usize, hidden: usize) -> Result<Tensor<B>> {
    t.narrow(1, k * hidden, hidden)
}

/// An LSTM cell with internal hidden and cell state.
pub struct Lstm<B: Backend> {
    w_ih: Tensor<B>,
    w_hh: Tensor<B>,
    bias: Tensor<B>,
    input_size: usize,
    hidden_size: usize,
    buffers: LayerBuffers<B>,
    ids: Option<LstmBuffers>,
    input: Option<Tensor<B>>,
}

impl<B: Backend> Lstm<B> {
    /// An LSTM cell with weights drawn from U(-1/√H, 1/√H).
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let k = 1.0 / (hidden_size.max(1) as f64).sqrt();
        let w_ih = init::uniform::<B>((4 * hidden_size, input_size), -k, k, dtype, device)?;
        let w_hh = init::uniform::<B>((4 * hidden_size, hidden_size), -k, k, dtype, device)?;
        let bias = init::uniform::<B>(4 * hidden_size, -k, k, dtype, device)?;
        Self::from_tensors(w_ih, w_hh, bias)
    }

    pub fn from_tensors(w_ih: Tensor<B>, w_hh: Tensor<B>, bias: Tensor<B>) -> Result<Self> {
        expect_rank("lstm", w_ih.shape(), 2)?;
        let (four_h, input_size) = (w_ih.dims()[0], w_ih.dims()[1]);
        if four_h % 4 != 0 {
            return Err(Error::unsupported(
                "lstm",
                format!("w_ih rows must be a multiple of 4, got {four_h}"),
            ));
        }
        let hidden_size = four_h / 4;
        let expected_hh = Shape::from((four_h, hidden_size));
        if w_hh.shape() != &expected_hh {
            return Err(Error::ShapeMismatch {
                op: "lstm",
                lhs: w_hh.shape().clone(),
                rhs: expected_hh,
            });
        }
        if bias.dims() != [four_h] {
            return Err(Error::ShapeMismatch {
                op: "lstm",
                lhs: bias.shape().clone(),
                rhs: Shape::from(four_h),
            });
        }
        Ok(Lstm {
            w_ih,
            w_hh,
            bias,
            input_size,
            hidden_size,
            buffers: LayerBuffers::new("lstm"),
            ids: None,
            input: None,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// The current `(h, c)` state, each `[N, H]`.
    pub fn state(&self) -> Result<(Tensor<B>, Tensor<B>)> {
        let ids = initialised(&self.ids, "lstm.state")?;
        Ok((self.buffers.get(ids.h)?, self.buffers.get(ids.c)?))
    }

    /// Zero the hidden and cell state.
    pub fn reset_state(&mut self) -> Result<()> {
        let (h, c) = self.state()?;
        ops::fill(&h, 0.0)?;
        ops::fill(&c, 0.0)?;
        Ok(())
    }

    /// Copy `h` and `c` into the internal state.
    pub fn set_state(&mut self, h: &Tensor<B>, c: &Tensor<B>) -> Result<()> {
        let (hs, cs) = self.state()?;
        ops::copy_to(&hs, h)?;
        ops::copy_to(&cs, c)?;
        Ok(())
    }

    /// Gradients with respect to the `(h, c)` state the last step started
    /// from, filled by `backward`.
    pub fn prev_state_grads(&self) -> Result<(Tensor<B>, Tensor<B>)> {
        let ids = initialised(&self.ids, "lstm.prev_state_grads")?;
        Ok((
            self.buffers.get(ids.h_prev_grad)?,
            self.buffers.get(ids.c_prev_grad)?,
        ))
    }

    fn batch_of(&self, op: &'static str, input_shape: &Shape) -> Result<usize> {
        expect_rank(op, input_shape, 2)?;
        if input_shape.dims()[1] != self.input_size {
            return Err(Error::ShapeMismatch {
                op,
                lhs: input_shape.clone(),
                rhs: self.w_ih.shape().clone(),
            });
        }
        Ok(input_shape.dims()[0])
    }
}

impl<B: Backend> Layer<B> for Lstm<B> {
    fn name(&self) -> &str {
        "lstm"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        let n = self.batch_of("lstm", input_shape)?;
        Ok(Shape::from((n, self.hidden_size)))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let n = self.batch_of("lstm.init", input_shape)?;
        let (h, i) = (self.hidden_size, self.input_size);
        let output_shape = Shape::from((n, h));
        let (dtype, dev) = (self.w_ih.dtype(), self.w_ih.device().clone());
        self.ids = None;
        self.input = None;

        let a = self.buffers.reopen();
        let ids = LstmBuffers {
            output: a.alloc(BufferRole::Output, (n, h), dtype, &dev)?,
            input_grad: a.alloc(BufferRole::InputGrad, (n, i), dtype, &dev)?,
            w_ih_grad: a.alloc(BufferRole::WeightGrad, (4 * h, i), dtype, &dev)?,
            w_hh_grad: a.alloc(BufferRole::Scratch("w_hh_grad"), (4 * h, h), dtype, &dev)?,
            bias_grad: a.alloc(BufferRole::BiasGrad, 4 * h, dtype, &dev)?,
            h_prev_grad: a.alloc(BufferRole::StateGrad("h"), (n, h), dtype, &dev)?,
            c_prev_grad: a.alloc(BufferRole::StateGrad("c"), (n, h), dtype, &dev)?,
            h: a.alloc(BufferRole::Scratch("h"), (n, h), dtype, &dev)?,
            c: a.alloc(BufferRole::Scratch("c"), (n, h), dtype, &dev)?,
            h_prev: a.alloc(BufferRole::Scratch("h_prev"), (n, h), dtype, &dev)?,
            c_prev: a.alloc(BufferRole::Scratch("c_prev"), (n, h), dtype, &dev)?,
            gates: a.alloc(BufferRole::Scratch("gates"), (n, 4 * h), dtype, &dev)?,
            acts: a.alloc(BufferRole::Scratch("acts"), (n, 4 * h), dtype, &dev)?,
            tanh_c: a.alloc(BufferRole::Scratch("tanh_c"), (n, h), dtype, &dev)?,
            ig: a.alloc(BufferRole::Scratch("ig"), (n, h), dtype, &dev)?,
            dc: a.alloc(BufferRole::Scratch("dc"), (n, h), dtype, &dev)?,
            dgates: a.alloc(BufferRole::Scratch("dgates"), (n, 4 * h), dtype, &dev)?,
        };
        self.buffers.seal(input_shape, &output_shape);
        self.ids = Some(ids);
        Ok(())
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "lstm.forward";
        self.buffers.check_input(op, x)?;
        let ids = initialised(&self.ids, op)?;
        let b = &self.buffers;
        let hs = self.hidden_size;
        let (h, c) = (b.get(ids.h)?, b.get(ids.c)?);
        let (h_prev, c_prev) = (b.get(ids.h_prev)?, b.get(ids.c_prev)?);
        let (gates, acts) = (b.get(ids.gates)?, b.get(ids.acts)?);
        let (tanh_c, ig, out) = (b.get(ids.tanh_c)?, b.get(ids.ig)?, b.get(ids.output)?);

        ops::copy_to(&h_prev, &h)?;
        ops::copy_to(&c_prev, &c)?;

        ops::matmul_to(&gates, x, &self.w_ih.t()?)?;
        ops::matmul_acc_to(&gates, &h_prev, &self.w_hh.t()?)?;
        ops::binary_assign(BinaryOp::Add, &gates, &self.bias)?;

        // i and f are adjacent, one sigmoid covers both
        ops::unary_to(
            UnaryOp::Sigmoid,
            &acts.narrow(1, 0, 2 * hs)?,
            &gates.narrow(1, 0, 2 * hs)?,
        )?;
        ops::unary_to(UnaryOp::Tanh, &gate(&acts, 2, hs)?, &gate(&gates, 2, hs)?)?;
        ops::unary_to(UnaryOp::Sigmoid, &gate(&acts, 3, hs)?, &gate(&gates, 3, hs)?)?;
        let (i, f, g, o) = (
            gate(&acts, 0, hs)?,
            gate(&acts, 1, hs)?,
            gate(&acts, 2, hs)?,
            gate(&acts, 3, hs)?,
        );

        ops::mul_to(&c, &f, &c_prev)?;
        ops::mul_to(&ig, &i, &g)?;
        ops::binary_assign(BinaryOp::Add, &c, &ig)?;
        ops::unary_to(UnaryOp::Tanh, &tanh_c, &c)?;
        ops::mul_to(&out, &o, &tanh_c)?;
        ops::copy_to(&h, &out)?;

        self.input = Some(x.clone());
        self.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "lstm.backward";
        self.buffers.check_backward(op, grad_out)?;
        let ids = initialised(&self.ids, op)?;
        let x = self
            .input
            .as_ref()
            .ok_or_else(|| Error::missing_state(op, "no cached input"))?;
        let b = &self.buffers;
        let hs = self.hidden_size;
        let dh = grad_out;
        let (acts, dgates) = (b.get(ids.acts)?, b.get(ids.dgates)?);
        let (tanh_c, dc, c_prev) = (b.get(ids.tanh_c)?, b.get(ids.dc)?, b.get(ids.c_prev)?);
        let (i, f, g, o) = (
            gate(&acts, 0, hs)?,
            gate(&acts, 1, hs)?,
            gate(&acts, 2, hs)?,
            gate(&acts, 3, hs)?,
        );
        let (di, df, dg, d_o) = (
            gate(&dgates, 0, hs)?,
            gate(&dgates, 1, hs)?,
            gate(&dgates, 2, hs)?,
            gate(&dgates, 3, hs)?,
        );

        ops::mul_to(&dc, dh, &o)?;
        ops::tanh_grad_to(&dc, &dc, &tanh_c)?;

        ops::mul_to(&d_o, dh, &tanh_c)?;
        ops::sigmoid_grad_to(&d_o, &d_o, &o)?;
        ops::mul_to(&di, &dc, &g)?;
        ops::sigmoid_grad_to(&di, &di, &i)?;
        ops::mul_to(&df, &dc, &c_prev)?;
        ops::sigmoid_grad_to(&df, &df, &f)?;
        ops::mul_to(&dg, &dc, &i)?;
        ops::tanh_grad_to(&dg, &dg, &g)?;

        ops::mul_to(&b.get(ids.c_prev_grad)?, &dc, &f)?;
        ops::matmul_to(&b.get(ids.w_ih_grad)?, &dgates.t()?, x)?;
        ops::matmul_to(&b.get(ids.w_hh_grad)?, &dgates.t()?, &b.get(ids.h_prev)?)?;
        ops::sum_to(&b.get(ids.bias_grad)?, &dgates, &[0], false)?;
        ops::matmul_to(&b.get(ids.h_prev_grad)?, &dgates, &self.w_hh)?;
        let dx = b.get(ids.input_grad)?;
        ops::matmul_to(&dx, &dgates, &self.w_ih)?;
        Ok(dx)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![self.w_ih.clone(), self.w_hh.clone(), self.bias.clone()]
    }

    fn gradients(&self) -> Vec<Tensor<B>> {
        let Some(ids) = self.ids else {
            return Vec::new();
        };
        [ids.w_ih_grad, ids.w_hh_grad, ids.bias_grad]
            .into_iter()
            .filter_map(|id| self.buffers.get(id).ok())
            .collect()
    }
}
