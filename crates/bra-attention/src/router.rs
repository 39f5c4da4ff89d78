//! Window-level top-k routing

use bra_common::{BraConfig, BraError, Result, ShapeError};
use candle_core::{D, Tensor};
use candle_nn::{Linear, VarBuilder};
use tracing::{debug, trace};

use crate::projection::linear_nd;

/// Routing decision for every query window
#[derive(Debug, Clone)]
pub struct Routing {
    /// `(batch, windows, topk)`, softmax over the selected logits.
    pub weights: Tensor,
    /// `(batch, windows, topk)` u32 window indices, highest logit first.
    pub indices: Tensor,
}

/// Scores window summaries against each other and keeps the `topk` best
#[derive(Debug, Clone)]
pub struct TopkRouter {
    topk: usize,
    scale: f64,
    diff_routing: bool,
    emb: Option<Linear>,
}

impl TopkRouter {
    pub fn new(
        qk_dim: usize,
        topk: usize,
        scale: f64,
        param_routing: bool,
        diff_routing: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if topk == 0 {
            return Err(BraError::config("topk must be greater than 0"));
        }
        if param_routing && !diff_routing {
            return Err(BraError::config("param_routing requires diff_routing to be enabled"));
        }
        let emb = if param_routing {
            Some(candle_nn::linear(qk_dim, qk_dim, vb.pp("emb"))?)
        } else {
            None
        };
        debug!(topk, scale, param_routing, diff_routing, "built top-k router");
        Ok(Self { topk, scale, diff_routing, emb })
    }

    pub fn from_config(config: &BraConfig, vb: VarBuilder) -> Result<Self> {
        Self::new(
            config.qk_dim(),
            config.topk,
            config.scale(),
            config.param_routing,
            config.diff_routing,
            vb,
        )
    }

    pub fn topk(&self) -> usize {
        self.topk
    }

    /// `query`, `key`: `(batch, windows, qk_dim)` window summaries.
    pub fn forward(&self, query: &Tensor, key: &Tensor) -> Result<Routing> {
        let (_, windows, _) = query.dims3()?;
        if self.topk > windows {
            return Err(ShapeError::TopkExceedsWindows { topk: self.topk, windows }.into());
        }
        let (query, key) = if self.diff_routing {
            (query.clone(), key.clone())
        } else {
            (query.detach(), key.detach())
        };
        let (query, key) = match &self.emb {
            Some(emb) => (linear_nd(emb, &query)?, linear_nd(emb, &key)?),
            None => (query, key),
        };

        let logits = (query * self.scale)?.matmul(&key.t()?)?;
        trace!(logits = ?logits.dims(), "routing logits");

        // stable descending sort: equal logits keep the lower window index first
        let indices = logits
            .detach()
            .arg_sort_last_dim(false)?
            .narrow(D::Minus1, 0, self.topk)?
            .contiguous()?;
        let top_logits = logits.contiguous()?.gather(&indices, D::Minus1)?;
        let weights = candle_nn::ops::softmax(&top_logits, D::Minus1)?;
        Ok(Routing { weights, indices })
    }
}
