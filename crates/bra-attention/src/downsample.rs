//! Key/value downsampling inside each window
//!
//! All policies operate on a channel-first grid `(N, C, d, h, w)` where `N`
//! is batch × windows. Pooling is applied one spatial axis at a time, which is
//! exact for both average and max reductions over box-shaped bins.

use bra_common::{BraConfig, BraError, DownsampleMode, Result, ShapeError};
use candle_core::Tensor;
use tracing::debug;

use crate::window::Extents;

/// Spatial axes of a channel-first grid with their names
const SPATIAL_AXES: [(usize, &str); 3] = [(2, "depth"), (3, "height"), (4, "width")];

/// Reduction applied to each pooling bin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    Avg,
    Max,
}

impl Reduce {
    fn apply_keepdim(&self, x: &Tensor, axis: usize) -> Result<Tensor> {
        Ok(match self {
            Self::Avg => x.mean_keepdim(axis)?,
            Self::Max => x.max_keepdim(axis)?,
        })
    }

    fn apply(&self, x: &Tensor, axis: usize) -> Result<Tensor> {
        Ok(match self {
            Self::Avg => x.mean(axis)?,
            Self::Max => x.max(axis)?,
        })
    }
}

/// Downsampling policy resolved from [`DownsampleMode`] at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvDownsampler {
    Identity,
    /// Kernel = stride = `ratio` along every spatial axis; remainders are dropped.
    Pool { ratio: usize, reduce: Reduce },
    /// Adaptive pooling to `target` bins along every spatial axis.
    Adaptive { target: usize, reduce: Reduce },
}

impl KvDownsampler {
    pub fn new(mode: DownsampleMode, ratio: usize, kv_per_win: usize) -> Result<Self> {
        let downsampler = match mode {
            DownsampleMode::Identity => Self::Identity,
            DownsampleMode::AvgPool | DownsampleMode::MaxPool if ratio == 1 => Self::Identity,
            DownsampleMode::AvgPool => Self::Pool { ratio, reduce: Reduce::Avg },
            DownsampleMode::MaxPool => Self::Pool { ratio, reduce: Reduce::Max },
            DownsampleMode::AdaAvgPool => {
                Self::Adaptive { target: kv_per_win, reduce: Reduce::Avg }
            }
            DownsampleMode::AdaMaxPool => {
                Self::Adaptive { target: kv_per_win, reduce: Reduce::Max }
            }
            DownsampleMode::FracPool | DownsampleMode::Conv => {
                return Err(BraError::not_implemented(format!(
                    "kv_downsample_mode '{mode}' is not implemented"
                )));
            }
        };
        if matches!(downsampler, Self::Pool { ratio: 0, .. } | Self::Adaptive { target: 0, .. }) {
            return Err(BraError::config(
                "downsampling ratio and kv_per_win must be greater than 0",
            ));
        }
        debug!(%mode, ?downsampler, "resolved key/value downsampler");
        Ok(downsampler)
    }

    pub fn from_config(config: &BraConfig) -> Result<Self> {
        Self::new(config.kv_downsample_mode, config.kv_downsample_ratio, config.kv_per_win)
    }

    /// Window extents after downsampling a window of extents `window`.
    pub fn output_extents(&self, window: Extents) -> Extents {
        match self {
            Self::Identity => window,
            Self::Pool { ratio, .. } => Extents::new(
                window.depth / ratio,
                window.height / ratio,
                window.width / ratio,
            ),
            Self::Adaptive { target, .. } => Extents::new(*target, *target, *target),
        }
    }

    /// `(N, C, d, h, w)` → `(N, C, d', h', w')`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims();
        if dims.len() != 5 {
            return Err(ShapeError::Rank { expected: 5, actual: dims.len() }.into());
        }
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Pool { ratio, reduce } => {
                let mut out = x.clone();
                for (axis, name) in SPATIAL_AXES {
                    out = pool_axis(&out, axis, name, *ratio, *reduce)?;
                }
                Ok(out)
            }
            Self::Adaptive { target, reduce } => {
                let mut out = x.clone();
                for (axis, _) in SPATIAL_AXES {
                    out = adaptive_pool_axis(&out, axis, *target, *reduce)?;
                }
                Ok(out)
            }
        }
    }
}

/// Non-overlapping pooling of width `ratio` along one axis.
fn pool_axis(
    x: &Tensor,
    axis: usize,
    name: &'static str,
    ratio: usize,
    reduce: Reduce,
) -> Result<Tensor> {
    let extent = x.dim(axis)?;
    if extent < ratio {
        return Err(ShapeError::WindowTooSmall { axis: name, extent, ratio }.into());
    }
    let bins = extent / ratio;
    let kept = if bins * ratio == extent { x.clone() } else { x.narrow(axis, 0, bins * ratio)? };
    let mut split = kept.dims().to_vec();
    split[axis] = bins;
    split.insert(axis + 1, ratio);
    reduce.apply(&kept.contiguous()?.reshape(split)?, axis + 1)
}

/// Adaptive bin `i` of `target` over an axis of length `len`: `[⌊i·len/t⌋, ⌈(i+1)·len/t⌉)`.
pub(crate) fn adaptive_bin(i: usize, len: usize, target: usize) -> (usize, usize) {
    let start = i * len / target;
    let end = ((i + 1) * len).div_ceil(target);
    (start, end)
}

fn adaptive_pool_axis(x: &Tensor, axis: usize, target: usize, reduce: Reduce) -> Result<Tensor> {
    let len = x.dim(axis)?;
    if len == target {
        return Ok(x.clone());
    }
    let bins = (0..target)
        .map(|i| {
            let (start, end) = adaptive_bin(i, len, target);
            reduce.apply_keepdim(&x.narrow(axis, start, end - start)?, axis)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&bins, axis)?)
}
