// CPU Backend — dense host-memory implementation of the marten capability set
//
// ARCHITECTURE:
// - CpuDevice is a unit marker; all memory is ordinary host memory
// - CpuStorage is an enum over Vec<T> for each supported dtype
// - Kernels are generic over the element type and dispatched by matching the
//   destination variant; float-only kernels report `Unimplemented` for the
//   integer dtypes
// - Sources are read through their layout (strides, offset, zero-stride
//   broadcast dims), so transposed and broadcast operands never get copied
// - rayon splits work into disjoint destination chunks: rows for matmul and
//   im2col, (sample, channel) planes for pooling, samples for col2im. Each
//   chunk accumulates in a fixed sequential order, so results do not depend
//   on the thread count
//
// USAGE:
//   let dev = CpuDevice;
//   let x = CpuTensor::randn((4, 3, 8, 8), DType::F32, &dev)?;

mod elementwise;
mod matmul;
mod reduce;
mod spatial;
mod storage;

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use marten_core::backend::{BackendBase, BackendDevice, BackendStorage, StorageOps};
use marten_core::dtype::{DType, WithDType};
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;
use marten_core::shape::Shape;

pub use storage::CpuStorage;

use storage::{CpuElem, View};

/// The host CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// The CPU backend. A zero-sized marker type.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl BackendBase for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn backend_name() -> &'static str {
        "cpu"
    }
}

impl StorageOps for CpuBackend {
    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::filled(shape.elem_count(), 0.0, dtype))
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::filled(shape.elem_count(), val, dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_iter(data.iter().copied(), dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        if !dtype.is_float() {
            return Err(Error::unimplemented("rand_uniform", dtype.to_string()));
        }
        let mut rng = rand::thread_rng();
        let values = (0..shape.elem_count()).map(|_| rng.gen::<f64>());
        Ok(CpuStorage::from_f64_iter(values, dtype))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        if !dtype.is_float() {
            return Err(Error::unimplemented("rand_normal", dtype.to_string()));
        }
        let mut rng = rand::thread_rng();
        let values = (0..shape.elem_count()).map(|_| StandardNormal.sample(&mut rng));
        Ok(CpuStorage::from_f64_iter(values, dtype))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        match input.dtype() {
            DType::F32 => read_f64::<f32>(input, layout),
            DType::F64 => read_f64::<f64>(input, layout),
            DType::U8 => read_f64::<u8>(input, layout),
            DType::U32 => read_f64::<u32>(input, layout),
            DType::I64 => read_f64::<i64>(input, layout),
        }
    }
}

fn read_f64<T: CpuElem>(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
    let view = View::<T>::new("to_f64_vec", input, layout)?;
    Ok((0..layout.elem_count()).map(|i| view.at(i).to_f64()).collect())
}

/// Convenience alias for CPU tensors.
pub type CpuTensor = marten_core::Tensor<CpuBackend>;


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn creation_and_readback() {
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        assert_eq!(x.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let xt = x.t().unwrap();
        assert_eq!(xt.to_f64_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn integer_dtypes_saturate() {
        let m = CpuTensor::from_f64_slice(&[-1.0, 0.0, 300.0], 3, DType::U8, &CpuDevice).unwrap();
        assert_eq!(m.to_f64_vec().unwrap(), vec![0.0, 0.0, 255.0]);
    }

    #[test]
    fn uniform_values_in_range() {
        let x = CpuTensor::rand(1000, DType::F32, &CpuDevice).unwrap();
        assert!(x.to_f64_vec().unwrap().iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn random_ints_are_unimplemented() {
        let err = CpuTensor::randn(4, DType::I64, &CpuDevice).unwrap_err();
        assert_eq!(err.kind(), marten_core::ErrorKind::Unimplemented);
    }

    #[test]
    fn device_name() {
        assert_eq!(CpuDevice.name(), "cpu");
    }
}
