use std::fmt;

use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

// BufferArena — every working buffer a layer needs, allocated once
//
// A layer declares its buffers during `init`, one per purpose:
//
//   let out = arena.alloc(BufferRole::Output, out_shape, dtype, dev)?;
//   let dx  = arena.alloc(BufferRole::InputGrad, in_shape, dtype, dev)?;
//   arena.seal();
//
// and refers to them afterwards through the returned `BufferId`. Once sealed
// the arena refuses further allocations, so the forward/backward hot path
// cannot grow memory by accident. `reset` reopens it when a layer is
// re-initialised for a different input shape.

/// What a buffer is for. Each role appears at most once per arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Output,
    InputGrad,
    WeightGrad,
    KernelGrad,
    BiasGrad,
    /// Gradient with respect to a piece of recurrent state, e.g. `"h"`.
    StateGrad(&'static str),
    /// Intermediate storage, e.g. `"columns"`.
    Scratch(&'static str),
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRole::Output => write!(f, "output"),
            BufferRole::InputGrad => write!(f, "input_grad"),
            BufferRole::WeightGrad => write!(f, "weight_grad"),
            BufferRole::KernelGrad => write!(f, "kernel_grad"),
            BufferRole::BiasGrad => write!(f, "bias_grad"),
            BufferRole::StateGrad(name) => write!(f, "state_grad:{name}"),
            BufferRole::Scratch(name) => write!(f, "scratch:{name}"),
        }
    }
}

/// Handle to a buffer in a [`BufferArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

struct Slot<B: Backend> {
    role: BufferRole,
    tensor: Tensor<B>,
}

/// The buffers owned by one layer.
pub struct BufferArena<B: Backend> {
    owner: String,
    slots: Vec<Slot<B>>,
    sealed: bool,
}

impl<B: Backend> BufferArena<B> {
    pub fn new(owner: impl Into<String>) -> Self {
        BufferArena {
            owner: owner.into(),
            slots: Vec::new(),
            sealed: false,
        }
    }

    /// Allocate a zeroed buffer for `role`.
    pub fn alloc(
        &mut self,
        role: BufferRole,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<BufferId> {
        if self.sealed {
            return Err(Error::msg(format!(
                "{}: cannot allocate {role} after initialisation",
                self.owner
            )));
        }
        if self.slots.iter().any(|s| s.role == role) {
            return Err(Error::msg(format!(
                "{}: buffer {role} allocated twice",
                self.owner
            )));
        }
        let tensor = Tensor::zeros(shape, dtype, device)?;
        self.slots.push(Slot { role, tensor });
        Ok(BufferId(self.slots.len() - 1))
    }

    /// Close the arena. Allocation fails from here until [`Self::reset`].
    pub fn seal(&mut self) {
        self.sealed = true;
        tracing::debug!(
            owner = %self.owner,
            buffers = self.slots.len(),
            bytes = self.total_bytes(),
            "buffer arena sealed"
        );
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Drop every buffer and reopen the arena.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.sealed = false;
    }

    pub fn get(&self, id: BufferId) -> Result<&Tensor<B>> {
        self.slots
            .get(id.0)
            .map(|s| &s.tensor)
            .ok_or_else(|| Error::missing_state(self.owner.clone(), format!("buffer #{}", id.0)))
    }

    pub fn by_role(&self, role: BufferRole) -> Option<&Tensor<B>> {
        self.slots.iter().find(|s| s.role == role).map(|s| &s.tensor)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes held by all buffers.
    pub fn total_bytes(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.tensor.elem_count() * s.tensor.dtype().size_in_bytes())
            .sum()
    }
}
