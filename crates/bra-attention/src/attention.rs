//! Multi-head attention between a query window and its routed windows

use bra_common::{BraError, Result, ShapeError};
use candle_core::{D, Tensor};
use tracing::trace;

/// Scaled dot-product attention over gathered key/value windows
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowedAttention {
    num_heads: usize,
    scale: f64,
}

impl WindowedAttention {
    pub fn new(num_heads: usize, scale: f64) -> Result<Self> {
        if num_heads == 0 {
            return Err(BraError::config("num_heads must be greater than 0"));
        }
        Ok(Self { num_heads, scale })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Attends each query window to the keys/values routed to it.
    ///
    /// * `q`: `(n, p, pixels, qk_dim)`
    /// * `k`: `(n, p, topk, kv_pixels, qk_dim)`
    /// * `v`: `(n, p, topk, kv_pixels, dim)`
    ///
    /// Returns the output `(n, p, pixels, dim)` and the attention weights
    /// `(n·p, heads, pixels, topk·kv_pixels)`.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (n, p, pixels, qk_dim) = q.dims4()?;
        let (_, _, topk, kv_pixels, k_dim) = k.dims5()?;
        let (_, _, _, _, dim) = v.dims5()?;
        if k_dim != qk_dim {
            return Err(ShapeError::ChannelMismatch { expected: qk_dim, actual: k_dim }.into());
        }
        let heads = self.num_heads;
        if !qk_dim.is_multiple_of(heads) || !dim.is_multiple_of(heads) {
            return Err(BraError::config(format!(
                "qk_dim ({qk_dim}) and dim ({dim}) must be divisible by num_heads ({heads})"
            )));
        }
        let windows = n * p;
        let keys = topk * kv_pixels;

        let split_heads = |t: &Tensor, len: usize, width: usize| -> Result<Tensor> {
            Ok(t.reshape((windows, len, heads, width / heads))?.transpose(1, 2)?.contiguous()?)
        };
        let q = split_heads(q, pixels, qk_dim)?;
        let k = split_heads(k, keys, qk_dim)?;
        let v = split_heads(v, keys, dim)?;

        let attn = (q * self.scale)?.matmul(&k.t()?)?;
        let attn = candle_nn::ops::softmax(&attn, D::Minus1)?;
        trace!(attn = ?attn.dims(), "windowed attention weights");

        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((n, p, pixels, dim))?;
        Ok((out, attn))
    }
}
