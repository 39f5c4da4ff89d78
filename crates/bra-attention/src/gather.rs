//! Gathering of routed key/value windows
//!
//! The output holds `topk` copies of window-sized blocks per query window, so
//! it is `topk×` the size of the key/value input. This is the dominant memory
//! cost of the block.

use bra_common::{BraError, Result, RoutingWeightMode, ShapeError};
use candle_core::Tensor;
use tracing::trace;

/// Pulls the routed key/value windows for every query window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvGather {
    weighting: RoutingWeightMode,
}

impl KvGather {
    pub fn new(weighting: RoutingWeightMode) -> Self {
        Self { weighting }
    }

    pub fn weighting(&self) -> RoutingWeightMode {
        self.weighting
    }

    /// `indices`, `weights`: `(n, p, topk)`; `kv`: `(n, p, pixels, c)`.
    /// Returns `(n, p, topk, pixels, c)`.
    pub fn forward(&self, indices: &Tensor, weights: &Tensor, kv: &Tensor) -> Result<Tensor> {
        if self.weighting == RoutingWeightMode::Hard {
            return Err(BraError::not_implemented("differentiable hard routing"));
        }
        let (n, p, topk) = indices.dims3()?;
        let (kv_n, kv_p, pixels, c) = kv.dims4()?;
        if (n, p) != (kv_n, kv_p) {
            return Err(ShapeError::RoutingMismatch {
                routing: indices.dims().to_vec(),
                kv: kv.dims().to_vec(),
            }
            .into());
        }

        // window indices are per batch element; offset them into the flattened (n·p) axis
        let offsets: Vec<u32> = (0..n).map(|b| (b * p) as u32).collect();
        let offsets = Tensor::from_vec(offsets, (n, 1, 1), indices.device())?;
        let global = indices.broadcast_add(&offsets)?.flatten_all()?;

        let selected = kv
            .reshape((n * p, pixels, c))?
            .index_select(&global, 0)?
            .reshape((n, p, topk, pixels, c))?;
        trace!(
            selected = ?selected.dims(),
            weighting = %self.weighting,
            "gathered key/value windows"
        );

        match self.weighting {
            RoutingWeightMode::Soft => {
                let scale = weights.reshape((n, p, topk, 1, 1))?;
                Ok(selected.broadcast_mul(&scale)?)
            }
            _ => Ok(selected),
        }
    }
}
