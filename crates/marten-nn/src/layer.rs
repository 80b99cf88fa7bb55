// Layer trait — forward and backward with buffers owned by the layer
//
// A layer goes through three phases:
//
//   new(..)             configuration only, parameters initialised
//   init(input_shape)   every output/gradient/scratch buffer is allocated
//                       into the layer's BufferArena, then the arena is
//                       sealed
//   forward/backward    write into those buffers, any number of times
//
// `forward` returns a handle to the layer's output buffer and `backward`
// a handle to its input-gradient buffer. The handles share storage with
// the buffers, so the next call overwrites what they show; clone the data
// out (`to_f64_vec`, `copy_to`) if it must outlive the step.
//
// Calling `forward` before `init` or `backward` before `forward` is
// MissingPrecomputedState. An input whose shape differs from the one passed
// to `init` is ShapeMismatch; re-run `init` to change it.

use marten_core::backend::Backend;
use marten_core::error::{Error, Result};
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;
use marten_core::{BufferArena, BufferId};

/// The interface every layer implements.
pub trait Layer<B: Backend> {
    /// Short name used in errors and logs.
    fn name(&self) -> &str;

    /// Allocate every buffer for inputs of `input_shape`.
    ///
    /// Calling it again re-allocates for the new shape.
    fn init(&mut self, input_shape: &Shape) -> Result<()>;

    /// Output shape for inputs of `input_shape`.
    fn output_shape(&self, input_shape: &Shape) -> Result<Shape>;

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>>;

    /// Gradient with respect to the last forward input, given the gradient
    /// with respect to its output. Parameter gradients land in the buffers
    /// reported by [`Layer::gradients`].
    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>>;

    fn parameters(&self) -> Vec<Tensor<B>> {
        Vec::new()
    }

    /// Gradient buffers, parallel to [`Layer::parameters`]. Empty before
    /// `init`.
    fn gradients(&self) -> Vec<Tensor<B>> {
        Vec::new()
    }

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Switch between training and inference behaviour. Only layers that
    /// behave differently (Dropout) override this.
    fn set_training(&mut self, _training: bool) {}

    fn is_training(&self) -> bool {
        false
    }
}

/// Arena plus the phase bookkeeping shared by every layer.
pub(crate) struct LayerBuffers<B: Backend> {
    arena: BufferArena<B>,
    input_shape: Option<Shape>,
    output_shape: Option<Shape>,
    forwarded: bool,
}

impl<B: Backend> LayerBuffers<B> {
    pub(crate) fn new(owner: &str) -> Self {
        LayerBuffers {
            arena: BufferArena::new(owner),
            input_shape: None,
            output_shape: None,
            forwarded: false,
        }
    }

    /// Drop the previous buffers and hand out the reopened arena.
    pub(crate) fn reopen(&mut self) -> &mut BufferArena<B> {
        self.arena.reset();
        self.input_shape = None;
        self.output_shape = None;
        self.forwarded = false;
        &mut self.arena
    }

    /// Seal the arena for inputs of `input` producing `output`.
    pub(crate) fn seal(&mut self, input: &Shape, output: &Shape) {
        self.arena.seal();
        self.input_shape = Some(input.clone());
        self.output_shape = Some(output.clone());
    }

    pub(crate) fn get(&self, id: BufferId) -> Result<Tensor<B>> {
        self.arena.get(id).cloned()
    }

    /// Validate a forward input against the initialised shape.
    pub(crate) fn check_input(&self, op: &'static str, x: &Tensor<B>) -> Result<()> {
        match &self.input_shape {
            None => Err(Error::missing_state(op, "layer has not been initialised")),
            Some(s) if s != x.shape() => Err(Error::ShapeMismatch {
                op,
                lhs: x.shape().clone(),
                rhs: s.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    pub(crate) fn mark_forward(&mut self) {
        self.forwarded = true;
    }

    /// Validate a backward call: a forward pass has run and `grad_out` has
    /// the output shape.
    pub(crate) fn check_backward(&self, op: &'static str, grad_out: &Tensor<B>) -> Result<()> {
        let expected = match (&self.output_shape, self.forwarded) {
            (Some(s), true) => s,
            (None, _) => return Err(Error::missing_state(op, "layer has not been initialised")),
            (Some(_), false) => {
                return Err(Error::missing_state(op, "backward called before forward"))
            }
        };
        if grad_out.shape() != expected {
            return Err(Error::ShapeMismatch {
                op,
                lhs: grad_out.shape().clone(),
                rhs: expected.clone(),
            });
        }
        Ok(())
    }
}

/// Buffer handles of an initialised layer.
pub(crate) fn initialised<T: Copy>(ids: &Option<T>, op: &'static str) -> Result<T> {
    ids.ok_or_else(|| Error::missing_state(op, "layer has not been initialised"))
}

/// Check `shape` has the expected rank.
pub(crate) fn expect_rank(op: &'static str, shape: &Shape, rank: usize) -> Result<()> {
    if shape.rank() != rank {
        return Err(Error::RankMismatch {
            op,
            expected: rank,
            got: shape.rank(),
        });
    }
    Ok(())
}
