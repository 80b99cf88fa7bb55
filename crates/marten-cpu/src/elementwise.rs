use num_traits::Float;
use rand::Rng;

use marten_core::backend::{BinaryOp, CmpOp, ElementwiseOps, GradOp, Operand, UnaryOp};
use marten_core::dtype::WithDType;
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;

use crate::storage::{dst_slice, map_into, with_any, with_float, CpuElem, CpuStorage, Src, View};
use crate::CpuBackend;

/// Float element types the arithmetic kernels are instantiated for.
pub(crate) trait FloatElem: CpuElem + Float {}

impl FloatElem for f32 {}
impl FloatElem for f64 {}

#[inline]
fn unary<T: FloatElem>(op: UnaryOp, x: T) -> T {
    match op {
        UnaryOp::Neg => -x,
        UnaryOp::Abs => x.abs(),
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Square => x * x,
        UnaryOp::Relu => x.max(T::zero()),
        UnaryOp::Sigmoid => T::one() / (T::one() + (-x).exp()),
        UnaryOp::Tanh => x.tanh(),
    }
}

#[inline]
fn binary<T: FloatElem>(op: BinaryOp, a: T, b: T) -> T {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Maximum => a.max(b),
        BinaryOp::Minimum => a.min(b),
    }
}

#[inline]
fn compare(op: CmpOp, a: f64, b: f64) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
    }
}

fn copy_typed<T: CpuElem>(dst: &mut [T], dl: &Layout, src: &CpuStorage, sl: &Layout) -> Result<()> {
    let src = View::<T>::new("copy", src, sl)?;
    map_into("copy", dst, dl, |i, _| src.at(i))
}

fn cmp_typed<T: CpuElem>(
    op: CmpOp,
    dst: &mut [u8],
    dl: &Layout,
    src: &CpuStorage,
    sl: &Layout,
    rhs: f64,
) -> Result<()> {
    let src = View::<T>::new("cmp", src, sl)?;
    map_into("cmp", dst, dl, |i, _| compare(op, src.at(i).to_f64(), rhs) as u8)
}

fn fused_typed<T: FloatElem>(
    op: GradOp,
    dst: &mut [T],
    dl: &Layout,
    grad: Operand<'_, CpuStorage>,
    aux: Operand<'_, CpuStorage>,
) -> Result<()> {
    let name = op.name();
    let g = Src::<T>::new(name, grad)?;
    match op {
        GradOp::ReluMask => {
            let mask = match aux {
                Operand::Buffer(s, l) => View::<u8>::new(name, s, l)?,
                Operand::Destination => {
                    return Err(Error::invalid_destination(
                        name,
                        "the mask cannot be the destination",
                    ))
                }
            };
            map_into(name, dst, dl, |i, cur| {
                if mask.at(i) != 0 {
                    g.get(i, cur)
                } else {
                    T::zero()
                }
            })
        }
        GradOp::Sigmoid => {
            let y = Src::<T>::new(name, aux)?;
            map_into(name, dst, dl, |i, cur| {
                let y = y.get(i, cur);
                g.get(i, cur) * y * (T::one() - y)
            })
        }
        GradOp::Tanh => {
            let y = Src::<T>::new(name, aux)?;
            map_into(name, dst, dl, |i, cur| {
                let y = y.get(i, cur);
                g.get(i, cur) * (T::one() - y * y)
            })
        }
        GradOp::Relu => {
            let x = Src::<T>::new(name, aux)?;
            map_into(name, dst, dl, |i, cur| {
                if x.get(i, cur) > T::zero() {
                    g.get(i, cur)
                } else {
                    T::zero()
                }
            })
        }
    }
}

impl ElementwiseOps for CpuBackend {
    fn fill(dst: &mut CpuStorage, dst_layout: &Layout, value: f64) -> Result<()> {
        with_any!(dst, |d: T| {
            let v = T::from_f64(value);
            map_into("fill", d, dst_layout, move |_, _| v)
        })
    }

    fn fill_uniform(dst: &mut CpuStorage, dst_layout: &Layout) -> Result<()> {
        let mut rng = rand::thread_rng();
        let draws: Vec<f64> = (0..dst_layout.elem_count()).map(|_| rng.gen()).collect();
        with_float!("fill_uniform", dst, |d: T| {
            map_into("fill_uniform", d, dst_layout, |i, _| T::from_f64(draws[i]))
        })
    }

    fn copy_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
    ) -> Result<()> {
        with_any!(dst, |d: T| copy_typed::<T>(d, dst_layout, src, src_layout))
    }

    fn unary_to(
        op: UnaryOp,
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: Operand<'_, CpuStorage>,
    ) -> Result<()> {
        with_float!(op.name(), dst, |d: T| {
            let s = Src::<T>::new(op.name(), src)?;
            map_into(op.name(), d, dst_layout, |i, cur| unary(op, s.get(i, cur)))
        })
    }

    fn affine_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: Operand<'_, CpuStorage>,
        mul: f64,
        add: f64,
    ) -> Result<()> {
        with_float!("affine", dst, |d: T| {
            let s = Src::<T>::new("affine", src)?;
            let (m, a) = (T::from_f64(mul), T::from_f64(add));
            map_into("affine", d, dst_layout, |i, cur| s.get(i, cur) * m + a)
        })
    }

    fn binary_to(
        op: BinaryOp,
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        lhs: Operand<'_, CpuStorage>,
        rhs: Operand<'_, CpuStorage>,
    ) -> Result<()> {
        with_float!(op.name(), dst, |d: T| {
            let l = Src::<T>::new(op.name(), lhs)?;
            let r = Src::<T>::new(op.name(), rhs)?;
            map_into(op.name(), d, dst_layout, |i, cur| {
                binary(op, l.get(i, cur), r.get(i, cur))
            })
        })
    }

    fn cmp_scalar_to(
        op: CmpOp,
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
        rhs: f64,
    ) -> Result<()> {
        let d = dst_slice::<u8>("cmp", dst)?;
        match src {
            CpuStorage::F32(_) => cmp_typed::<f32>(op, d, dst_layout, src, src_layout, rhs),
            CpuStorage::F64(_) => cmp_typed::<f64>(op, d, dst_layout, src, src_layout, rhs),
            CpuStorage::U8(_) => cmp_typed::<u8>(op, d, dst_layout, src, src_layout, rhs),
            CpuStorage::U32(_) => cmp_typed::<u32>(op, d, dst_layout, src, src_layout, rhs),
            CpuStorage::I64(_) => cmp_typed::<i64>(op, d, dst_layout, src, src_layout, rhs),
        }
    }

    fn fused_grad_to(
        op: GradOp,
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        grad: Operand<'_, CpuStorage>,
        aux: Operand<'_, CpuStorage>,
    ) -> Result<()> {
        with_float!(op.name(), dst, |d: T| fused_typed::<T>(
            op, d, dst_layout, grad, aux
        ))
    }
}
