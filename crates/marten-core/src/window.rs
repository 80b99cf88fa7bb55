use crate::error::{Error, Result};
use crate::shape::Shape;

// Window2d / Geometry2d — spatial parameters for convolution and pooling
//
// A Window2d is what a layer is configured with: kernel size, stride and
// zero-padding per spatial axis. It is validated once, at construction.
//
// A Geometry2d is a window resolved against a concrete [N, C, H, W] input.
// It carries every size the kernels need so backends never recompute them:
//
//   H_out = floor((H + 2*pad_h - kernel_h) / stride_h) + 1
//   W_out = floor((W + 2*pad_w - kernel_w) / stride_w) + 1
//
// Resolution fails with UnsupportedConfiguration when the kernel does not
// fit inside the padded input.

/// Kernel size, stride and padding for a 2-D sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window2d {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

impl Window2d {
    /// Validate and build a window. Kernel sizes and strides must be ≥ 1.
    pub fn new(kernel: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Result<Self> {
        if kernel.contains(&0) {
            return Err(Error::unsupported(
                "window",
                format!("kernel size must be >= 1, got {:?}", kernel),
            ));
        }
        if stride.contains(&0) {
            return Err(Error::unsupported(
                "window",
                format!("stride must be >= 1, got {:?}", stride),
            ));
        }
        Ok(Window2d {
            kernel,
            stride,
            padding,
        })
    }

    /// Build a window from signed values, rejecting negatives.
    pub fn from_signed(kernel: [i64; 2], stride: [i64; 2], padding: [i64; 2]) -> Result<Self> {
        fn convert(name: &str, v: [i64; 2]) -> Result<[usize; 2]> {
            let mut out = [0usize; 2];
            for (o, &x) in out.iter_mut().zip(v.iter()) {
                *o = usize::try_from(x).map_err(|_| {
                    Error::unsupported("window", format!("{name} must be non-negative, got {:?}", v))
                })?;
            }
            Ok(out)
        }
        Self::new(
            convert("kernel size", kernel)?,
            convert("stride", stride)?,
            convert("padding", padding)?,
        )
    }

    /// Square window with the same kernel/stride/padding on both axes.
    pub fn square(kernel: usize, stride: usize, padding: usize) -> Result<Self> {
        Self::new([kernel; 2], [stride; 2], [padding; 2])
    }

    /// A 1-D window laid out on the first spatial axis of a `[.., L, 1]` view.
    pub fn for_1d(kernel: usize, stride: usize, padding: usize) -> Result<Self> {
        Self::new([kernel, 1], [stride, 1], [padding, 0])
    }

    /// Whether this window leaves the second spatial axis untouched.
    pub fn is_1d(&self) -> bool {
        self.kernel[1] == 1 && self.stride[1] == 1 && self.padding[1] == 0
    }

    /// Pooling windows additionally need every window to touch real input.
    ///
    /// With `padding < kernel` the first and last windows on each axis start
    /// inside the input, so no window is made of padding alone.
    pub fn check_pooling(&self) -> Result<()> {
        for axis in 0..2 {
            if self.padding[axis] >= self.kernel[axis] {
                return Err(Error::unsupported(
                    "pool2d",
                    format!(
                        "padding {:?} must be smaller than kernel {:?}",
                        self.padding, self.kernel
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Output spatial size for an input of spatial size `in_hw`.
    pub fn output_hw(&self, in_hw: [usize; 2]) -> Result<[usize; 2]> {
        let mut out = [0usize; 2];
        for axis in 0..2 {
            let padded = in_hw[axis] + 2 * self.padding[axis];
            if self.kernel[axis] > padded {
                return Err(Error::unsupported(
                    "window",
                    format!(
                        "kernel {:?} larger than padded input {:?} (padding {:?})",
                        self.kernel, in_hw, self.padding
                    ),
                ));
            }
            out[axis] = (padded - self.kernel[axis]) / self.stride[axis] + 1;
        }
        Ok(out)
    }
}

/// A window resolved against an `[N, C, H, W]` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry2d {
    pub batch: usize,
    pub channels: usize,
    pub in_hw: [usize; 2],
    pub out_hw: [usize; 2],
    pub window: Window2d,
}

impl Geometry2d {
    /// Resolve `window` for a rank-4 `input` shape.
    pub fn resolve(input: &Shape, window: Window2d) -> Result<Self> {
        let dims = input.dims();
        if dims.len() != 4 {
            return Err(Error::RankMismatch {
                op: "geometry2d",
                expected: 4,
                got: dims.len(),
            });
        }
        let in_hw = [dims[2], dims[3]];
        let out_hw = window.output_hw(in_hw)?;
        Ok(Geometry2d {
            batch: dims[0],
            channels: dims[1],
            in_hw,
            out_hw,
            window,
        })
    }

    pub fn input_shape(&self) -> Shape {
        Shape::new(vec![self.batch, self.channels, self.in_hw[0], self.in_hw[1]])
    }

    /// Output shape with `channels` output channels.
    pub fn output_shape(&self, channels: usize) -> Shape {
        Shape::new(vec![self.batch, channels, self.out_hw[0], self.out_hw[1]])
    }

    /// Output spatial positions per sample.
    pub fn positions(&self) -> usize {
        self.out_hw[0] * self.out_hw[1]
    }

    /// Elements in one receptive field across all input channels.
    pub fn patch_len(&self) -> usize {
        self.channels * self.window.kernel[0] * self.window.kernel[1]
    }

    /// Shape of the patch matrix: one row per output position in the batch,
    /// one column per receptive-field element.
    pub fn columns_shape(&self) -> Shape {
        Shape::new(vec![self.batch * self.positions(), self.patch_len()])
    }
}
