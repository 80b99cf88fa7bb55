use rayon::prelude::*;

use marten_core::backend::SpatialOps;
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;
use marten_core::window::Geometry2d;

use crate::elementwise::FloatElem;
use crate::storage::{dense_mut, dst_slice, with_float, CpuStorage, View};
use crate::CpuBackend;

// Spatial kernels
//
// Every kernel splits its dense destination into disjoint chunks and hands
// them to rayon: one patch row per output position for im2col, one sample
// for col2im, one (n, c) plane for pooling. Inside a chunk the work runs in
// a fixed sequential order, so scattered sums are reproducible.
//
// Sources are read through `View` in logical order, with these flat
// positions:
//
//   input  [N, C, H, W]     ((n*C + c)*H + h)*W + w
//   output [N, C, Ho, Wo]   ((n*C + c)*Ho + oh)*Wo + ow
//   cols   [N*P, K]         (n*P + p)*K + (c*kH + ki)*kW + kj

/// Input coordinate for output coordinate `o` and kernel tap `k`, or `None`
/// when it falls in the padding.
#[inline]
fn tap(o: usize, k: usize, stride: usize, pad: usize, len: usize) -> Option<usize> {
    (o * stride + k).checked_sub(pad).filter(|&i| i < len)
}

/// Valid `(ih, iw)` positions of the window at `(oh, ow)`, in row-major
/// window order.
fn window_taps(geom: &Geometry2d, oh: usize, ow: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
    let w = &geom.window;
    let [h_in, w_in] = geom.in_hw;
    (0..w.kernel[0])
        .filter_map(move |ki| tap(oh, ki, w.stride[0], w.padding[0], h_in))
        .flat_map(move |ih| {
            (0..w.kernel[1])
                .filter_map(move |kj| tap(ow, kj, w.stride[1], w.padding[1], w_in))
                .map(move |iw| (ih, iw))
        })
}

fn im2col_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    src: &CpuStorage,
    sl: &Layout,
    geom: &Geometry2d,
) -> Result<()> {
    let out = dense_mut("im2col", dst, dl)?;
    let s = View::<T>::new("im2col", src, sl)?;
    let k = geom.patch_len();
    if out.is_empty() || k == 0 {
        return Ok(());
    }
    let p_len = geom.positions();
    let [h_in, w_in] = geom.in_hw;
    let [kh, kw] = geom.window.kernel;
    let [sh, sw] = geom.window.stride;
    let [ph, pw] = geom.window.padding;
    let c_in = geom.channels;

    out.par_chunks_mut(k).enumerate().for_each(|(r, row)| {
        let (n, p) = (r / p_len, r % p_len);
        let (oh, ow) = (p / geom.out_hw[1], p % geom.out_hw[1]);
        for c in 0..c_in {
            let plane = (n * c_in + c) * h_in;
            for ki in 0..kh {
                let ih = tap(oh, ki, sh, ph, h_in);
                for kj in 0..kw {
                    let col = (c * kh + ki) * kw + kj;
                    row[col] = match (ih, tap(ow, kj, sw, pw, w_in)) {
                        (Some(ih), Some(iw)) => s.at((plane + ih) * w_in + iw),
                        _ => T::zero(),
                    };
                }
            }
        }
    });
    Ok(())
}

fn col2im_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    cols: &CpuStorage,
    cl: &Layout,
    geom: &Geometry2d,
) -> Result<()> {
    let out = dense_mut("col2im", dst, dl)?;
    let s = View::<T>::new("col2im", cols, cl)?;
    out.iter_mut().for_each(|v| *v = T::zero());
    let [h_in, w_in] = geom.in_hw;
    let sample = geom.channels * h_in * w_in;
    if sample == 0 {
        return Ok(());
    }
    let k = geom.patch_len();
    let p_len = geom.positions();
    let [kh, kw] = geom.window.kernel;
    let [sh, sw] = geom.window.stride;
    let [ph, pw] = geom.window.padding;

    out.par_chunks_mut(sample).enumerate().for_each(|(n, img)| {
        for p in 0..p_len {
            let (oh, ow) = (p / geom.out_hw[1], p % geom.out_hw[1]);
            let row = (n * p_len + p) * k;
            for c in 0..geom.channels {
                for ki in 0..kh {
                    let Some(ih) = tap(oh, ki, sh, ph, h_in) else {
                        continue;
                    };
                    for kj in 0..kw {
                        let Some(iw) = tap(ow, kj, sw, pw, w_in) else {
                            continue;
                        };
                        let at = (c * h_in + ih) * w_in + iw;
                        img[at] = img[at] + s.at(row + (c * kh + ki) * kw + kj);
                    }
                }
            }
        }
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn max_pool_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    indices: &mut [i64],
    il: &Layout,
    src: &CpuStorage,
    sl: &Layout,
    geom: &Geometry2d,
) -> Result<()> {
    let out = dense_mut("max_pool2d", dst, dl)?;
    let idx = dense_mut("max_pool2d", indices, il)?;
    let s = View::<T>::new("max_pool2d", src, sl)?;
    let p_len = geom.positions();
    if p_len == 0 {
        return Ok(());
    }
    let hw = geom.in_hw[0] * geom.in_hw[1];
    let w_in = geom.in_hw[1];

    out.par_chunks_mut(p_len)
        .zip(idx.par_chunks_mut(p_len))
        .enumerate()
        .for_each(|(q, (plane, plane_idx))| {
            for (p, (v, i)) in plane.iter_mut().zip(plane_idx.iter_mut()).enumerate() {
                let (oh, ow) = (p / geom.out_hw[1], p % geom.out_hw[1]);
                let mut best = T::neg_infinity();
                let mut best_at = -1i64;
                for (ih, iw) in window_taps(geom, oh, ow) {
                    let at = q * hw + ih * w_in + iw;
                    let x = s.at(at);
                    if best_at < 0 || x > best {
                        best = x;
                        best_at = at as i64;
                    }
                }
                *v = best;
                *i = best_at;
            }
        });
    Ok(())
}

fn max_pool_backward_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    grad: &CpuStorage,
    gl: &Layout,
    indices: &CpuStorage,
    il: &Layout,
    geom: &Geometry2d,
) -> Result<()> {
    let op = "max_pool2d_backward";
    let out = dense_mut(op, dst, dl)?;
    let g = View::<T>::new(op, grad, gl)?;
    let idx = View::<i64>::new(op, indices, il)?;
    let hw = geom.in_hw[0] * geom.in_hw[1];
    let p_len = geom.positions();
    let planes = geom.batch * geom.channels;

    // dst stays untouched unless every recorded offset lands in its own plane
    if let Some((o, i)) = (0..planes * p_len)
        .map(|o| (o, idx.at(o)))
        .find(|&(o, i)| i >= 0 && (i as usize) / hw.max(1) != o / p_len.max(1))
    {
        return Err(Error::msg(format!(
            "{op}: recorded index {i} lies outside plane {}",
            o / p_len.max(1)
        )));
    }
    out.iter_mut().for_each(|v| *v = T::zero());
    if hw == 0 {
        return Ok(());
    }

    out.par_chunks_mut(hw).enumerate().for_each(|(q, plane)| {
        for o in q * p_len..(q + 1) * p_len {
            let i = idx.at(o);
            if i >= 0 {
                let local = i as usize - q * hw;
                plane[local] = plane[local] + g.at(o);
            }
        }
    });
    Ok(())
}

fn avg_pool_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    src: &CpuStorage,
    sl: &Layout,
    geom: &Geometry2d,
) -> Result<()> {
    let out = dense_mut("avg_pool2d", dst, dl)?;
    let s = View::<T>::new("avg_pool2d", src, sl)?;
    let p_len = geom.positions();
    if p_len == 0 {
        return Ok(());
    }
    let hw = geom.in_hw[0] * geom.in_hw[1];
    let w_in = geom.in_hw[1];

    out.par_chunks_mut(p_len).enumerate().for_each(|(q, plane)| {
        for (p, v) in plane.iter_mut().enumerate() {
            let (oh, ow) = (p / geom.out_hw[1], p % geom.out_hw[1]);
            let mut sum = T::zero();
            let mut count = 0usize;
            for (ih, iw) in window_taps(geom, oh, ow) {
                sum = sum + s.at(q * hw + ih * w_in + iw);
                count += 1;
            }
            *v = if count == 0 {
                T::zero()
            } else {
                sum / T::from_f64(count as f64)
            };
        }
    });
    Ok(())
}

fn avg_pool_backward_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    grad: &CpuStorage,
    gl: &Layout,
    geom: &Geometry2d,
) -> Result<()> {
    let op = "avg_pool2d_backward";
    let out = dense_mut(op, dst, dl)?;
    let g = View::<T>::new(op, grad, gl)?;
    out.iter_mut().for_each(|v| *v = T::zero());
    let hw = geom.in_hw[0] * geom.in_hw[1];
    if hw == 0 {
        return Ok(());
    }
    let p_len = geom.positions();
    let w_in = geom.in_hw[1];

    out.par_chunks_mut(hw).enumerate().for_each(|(q, plane)| {
        for p in 0..p_len {
            let (oh, ow) = (p / geom.out_hw[1], p % geom.out_hw[1]);
            let count = window_taps(geom, oh, ow).count();
            if count == 0 {
                continue;
            }
            let share = g.at(q * p_len + p) / T::from_f64(count as f64);
            for (ih, iw) in window_taps(geom, oh, ow) {
                let at = ih * w_in + iw;
                plane[at] = plane[at] + share;
            }
        }
    });
    Ok(())
}

/// Region `[start, end)` of input axis `len` covered by adaptive output
/// `o` of `out_len`.
#[inline]
fn region(o: usize, len: usize, out_len: usize) -> (usize, usize) {
    (o * len / out_len, (o + 1) * len / out_len)
}

/// `[H, W]` and `[Ho, Wo]` of an adaptive pooling pair, from the input-side
/// and output-side layouts.
fn adaptive_sizes(input: &Layout, output: &Layout) -> ([usize; 2], [usize; 2]) {
    let (i, o) = (input.dims(), output.dims());
    ([i[2], i[3]], [o[2], o[3]])
}

fn adaptive_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    src: &CpuStorage,
    sl: &Layout,
) -> Result<()> {
    let op = "adaptive_avg_pool2d";
    let ([h, w], [oh_len, ow_len]) = adaptive_sizes(sl, dl);
    let out = dense_mut(op, dst, dl)?;
    let s = View::<T>::new(op, src, sl)?;
    let p_len = oh_len * ow_len;
    if p_len == 0 {
        return Ok(());
    }

    out.par_chunks_mut(p_len).enumerate().for_each(|(q, plane)| {
        for (p, v) in plane.iter_mut().enumerate() {
            let (h0, h1) = region(p / ow_len, h, oh_len);
            let (w0, w1) = region(p % ow_len, w, ow_len);
            let count = (h1 - h0) * (w1 - w0);
            if count == 0 {
                *v = T::zero();
                continue;
            }
            let mut sum = T::zero();
            for ih in h0..h1 {
                for iw in w0..w1 {
                    sum = sum + s.at((q * h + ih) * w + iw);
                }
            }
            *v = sum / T::from_f64(count as f64);
        }
    });
    Ok(())
}

fn adaptive_backward_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    grad: &CpuStorage,
    gl: &Layout,
) -> Result<()> {
    let op = "adaptive_avg_pool2d_backward";
    let ([h, w], [oh_len, ow_len]) = adaptive_sizes(dl, gl);
    let out = dense_mut(op, dst, dl)?;
    let g = View::<T>::new(op, grad, gl)?;
    out.iter_mut().for_each(|v| *v = T::zero());
    let hw = h * w;
    if hw == 0 || oh_len == 0 || ow_len == 0 {
        return Ok(());
    }
    let p_len = oh_len * ow_len;

    out.par_chunks_mut(hw).enumerate().for_each(|(q, plane)| {
        for p in 0..p_len {
            let (h0, h1) = region(p / ow_len, h, oh_len);
            let (w0, w1) = region(p % ow_len, w, ow_len);
            let count = (h1 - h0) * (w1 - w0);
            if count == 0 {
                continue;
            }
            let share = g.at(q * p_len + p) / T::from_f64(count as f64);
            for ih in h0..h1 {
                for iw in w0..w1 {
                    plane[ih * w + iw] = plane[ih * w + iw] + share;
                }
            }
        }
    });
    Ok(())
}

impl SpatialOps for CpuBackend {
    fn im2col_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
        geom: &Geometry2d,
    ) -> Result<()> {
        with_float!("im2col", dst, |d: T| im2col_typed::<T>(
            d, dst_layout, src, src_layout, geom
        ))
    }

    fn col2im_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        cols: &CpuStorage,
        cols_layout: &Layout,
        geom: &Geometry2d,
    ) -> Result<()> {
        with_float!("col2im", dst, |d: T| col2im_typed::<T>(
            d, dst_layout, cols, cols_layout, geom
        ))
    }

    fn max_pool2d_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        indices: &mut CpuStorage,
        indices_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
        geom: &Geometry2d,
    ) -> Result<()> {
        let idx = dst_slice::<i64>("max_pool2d", indices)?;
        with_float!("max_pool2d", dst, |d: T| max_pool_typed::<T>(
            d,
            dst_layout,
            idx,
            indices_layout,
            src,
            src_layout,
            geom
        ))
    }

    fn max_pool2d_backward_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        grad: &CpuStorage,
        grad_layout: &Layout,
        indices: &CpuStorage,
        indices_layout: &Layout,
        geom: &Geometry2d,
    ) -> Result<()> {
        with_float!("max_pool2d_backward", dst, |d: T| {
            max_pool_backward_typed::<T>(
                d,
                dst_layout,
                grad,
                grad_layout,
                indices,
                indices_layout,
                geom,
            )
        })
    }

    fn avg_pool2d_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
        geom: &Geometry2d,
    ) -> Result<()> {
        with_float!("avg_pool2d", dst, |d: T| avg_pool_typed::<T>(
            d, dst_layout, src, src_layout, geom
        ))
    }

    fn avg_pool2d_backward_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        grad: &CpuStorage,
        grad_layout: &Layout,
        geom: &Geometry2d,
    ) -> Result<()> {
        with_float!("avg_pool2d_backward", dst, |d: T| {
            avg_pool_backward_typed::<T>(d, dst_layout, grad, grad_layout, geom)
        })
    }

    fn adaptive_avg_pool2d_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
    ) -> Result<()> {
        with_float!("adaptive_avg_pool2d", dst, |d: T| adaptive_typed::<T>(
            d, dst_layout, src, src_layout
        ))
    }

    fn adaptive_avg_pool2d_backward_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        grad: &CpuStorage,
        grad_layout: &Layout,
    ) -> Result<()> {
        with_float!("adaptive_avg_pool2d_backward", dst, |d: T| {
            adaptive_backward_typed::<T>(d, dst_layout, grad, grad_layout)
        })
    }
}
