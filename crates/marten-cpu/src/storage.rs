use std::fmt;

use rayon::prelude::*;

use marten_core::backend::{BackendStorage, Operand};
use marten_core::dtype::{DType, WithDType};
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;

// CpuStorage — host memory for each supported dtype
//
// Kernels are written once, generically over the element type, and reach
// the typed slice through `CpuElem`. Sources are wrapped in a `View` that
// resolves logical element i to a storage slot:
//
//   View::Dense(slice)            slice[i]              (row-major run)
//   View::Strided(slice, layout)  slice[offset_of(i)]   (transposed, narrowed,
//                                                        broadcast, ...)
//
// `Src` adds the in-place case, where the operand is the destination's own
// current value.

/// Element count above which elementwise kernels split work across rayon.
pub(crate) const PARALLEL_THRESHOLD: usize = 4096;

/// Host-side storage. Each variant owns a `Vec` of the matching element type.
#[derive(Clone)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    U32(Vec<u32>),
    I64(Vec<i64>),
}

impl fmt::Debug for CpuStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuStorage::{:?}(len={})", self.dtype(), self.len())
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::U32(_) => DType::U32,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::U32(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

impl CpuStorage {
    /// Build storage of `dtype` holding `n` copies of `value`.
    pub(crate) fn filled(n: usize, value: f64, dtype: DType) -> Self {
        match dtype {
            DType::F32 => CpuStorage::F32(vec![f32::from_f64(value); n]),
            DType::F64 => CpuStorage::F64(vec![value; n]),
            DType::U8 => CpuStorage::U8(vec![u8::from_f64(value); n]),
            DType::U32 => CpuStorage::U32(vec![u32::from_f64(value); n]),
            DType::I64 => CpuStorage::I64(vec![i64::from_f64(value); n]),
        }
    }

    /// Convert host values into storage of `dtype`.
    pub(crate) fn from_f64_iter(data: impl Iterator<Item = f64>, dtype: DType) -> Self {
        match dtype {
            DType::F32 => CpuStorage::F32(data.map(f32::from_f64).collect()),
            DType::F64 => CpuStorage::F64(data.collect()),
            DType::U8 => CpuStorage::U8(data.map(u8::from_f64).collect()),
            DType::U32 => CpuStorage::U32(data.map(u32::from_f64).collect()),
            DType::I64 => CpuStorage::I64(data.map(i64::from_f64).collect()),
        }
    }
}

/// Element types with a `CpuStorage` variant.
pub(crate) trait CpuElem: WithDType {
    fn slice(s: &CpuStorage) -> Option<&[Self]>;
    fn slice_mut(s: &mut CpuStorage) -> Option<&mut [Self]>;
}

macro_rules! cpu_elem {
    ($t:ty, $variant:ident) => {
        impl CpuElem for $t {
            fn slice(s: &CpuStorage) -> Option<&[Self]> {
                match s {
                    CpuStorage::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn slice_mut(s: &mut CpuStorage) -> Option<&mut [Self]> {
                match s {
                    CpuStorage::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

cpu_elem!(f32, F32);
cpu_elem!(f64, F64);
cpu_elem!(u8, U8);
cpu_elem!(u32, U32);
cpu_elem!(i64, I64);

/// Run `$body` with `$d` bound to the typed destination slice and `$t`
/// naming its float element type. Integer destinations are `Unimplemented`.
macro_rules! with_float {
    ($op:expr, $dst:expr, |$d:ident: $t:ident| $body:expr) => {
        match $dst {
            $crate::storage::CpuStorage::F32($d) => {
                #[allow(dead_code)]
                type $t = f32;
                $body
            }
            $crate::storage::CpuStorage::F64($d) => {
                #[allow(dead_code)]
                type $t = f64;
                $body
            }
            other => Err(marten_core::Error::unimplemented(
                $op,
                marten_core::BackendStorage::dtype(&*other).to_string(),
            )),
        }
    };
}

/// Like [`with_float`] for kernels that move values without arithmetic.
macro_rules! with_any {
    ($dst:expr, |$d:ident: $t:ident| $body:expr) => {
        match $dst {
            $crate::storage::CpuStorage::F32($d) => {
                type $t = f32;
                $body
            }
            $crate::storage::CpuStorage::F64($d) => {
                type $t = f64;
                $body
            }
            $crate::storage::CpuStorage::U8($d) => {
                type $t = u8;
                $body
            }
            $crate::storage::CpuStorage::U32($d) => {
                type $t = u32;
                $body
            }
            $crate::storage::CpuStorage::I64($d) => {
                type $t = i64;
                $body
            }
        }
    };
}

pub(crate) use with_any;
pub(crate) use with_float;

/// Read access to a source buffer in logical element order.
pub(crate) enum View<'a, T> {
    Dense(&'a [T]),
    Strided(&'a [T], &'a Layout),
}

impl<'a, T: CpuElem> View<'a, T> {
    pub(crate) fn new(op: &'static str, s: &'a CpuStorage, l: &'a Layout) -> Result<Self> {
        let data = T::slice(s).ok_or(Error::DTypeMismatch {
            op,
            expected: T::DTYPE,
            got: s.dtype(),
        })?;
        match l.dense_range() {
            Some((a, b)) => data
                .get(a..b)
                .map(View::Dense)
                .ok_or_else(|| Error::msg(format!("{op}: layout exceeds its storage"))),
            None => Ok(View::Strided(data, l)),
        }
    }

    /// Element `i` in logical order.
    #[inline]
    pub(crate) fn at(&self, i: usize) -> T {
        match self {
            View::Dense(s) => s[i],
            View::Strided(s, l) => s[l.offset_of(i)],
        }
    }
}

/// A kernel operand: a separate buffer or the destination itself.
pub(crate) enum Src<'a, T> {
    View(View<'a, T>),
    Dst,
}

impl<'a, T: CpuElem> Src<'a, T> {
    pub(crate) fn new(op: &'static str, operand: Operand<'a, CpuStorage>) -> Result<Self> {
        match operand {
            Operand::Buffer(s, l) => View::new(op, s, l).map(Src::View),
            Operand::Destination => Ok(Src::Dst),
        }
    }

    /// Element `i`, where `cur` is the destination's current value at `i`.
    #[inline]
    pub(crate) fn get(&self, i: usize, cur: T) -> T {
        match self {
            Src::View(v) => v.at(i),
            Src::Dst => cur,
        }
    }
}

/// Typed destination slice.
pub(crate) fn dst_slice<'a, T: CpuElem>(op: &'static str, s: &'a mut CpuStorage) -> Result<&'a mut [T]> {
    let got = s.dtype();
    T::slice_mut(s).ok_or(Error::DTypeMismatch {
        op,
        expected: T::DTYPE,
        got,
    })
}

/// The dense run of a destination.
pub(crate) fn dense_mut<'a, T>(op: &'static str, dst: &'a mut [T], dl: &Layout) -> Result<&'a mut [T]> {
    let (a, b) = dl
        .dense_range()
        .ok_or_else(|| Error::invalid_destination(op, "kernel requires a dense destination"))?;
    dst.get_mut(a..b)
        .ok_or_else(|| Error::msg(format!("{op}: layout exceeds its storage")))
}

/// `dst[i] = f(i, dst[i])` over every logical element of `dl`.
pub(crate) fn map_into<T, F>(op: &'static str, dst: &mut [T], dl: &Layout, f: F) -> Result<()>
where
    T: Copy + Send + Sync,
    F: Fn(usize, T) -> T + Send + Sync,
{
    if dl.is_dense() {
        let out = dense_mut(op, dst, dl)?;
        if out.len() >= PARALLEL_THRESHOLD {
            out.par_iter_mut()
                .enumerate()
                .for_each(|(i, v)| *v = f(i, *v));
        } else {
            for (i, v) in out.iter_mut().enumerate() {
                *v = f(i, *v);
            }
        }
        return Ok(());
    }
    for i in 0..dl.elem_count() {
        let v = dst
            .get_mut(dl.offset_of(i))
            .ok_or_else(|| Error::msg(format!("{op}: layout exceeds its storage")))?;
        *v = f(i, *v);
    }
    Ok(())
}
