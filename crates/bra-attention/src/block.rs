//! Bi-level routing attention block
//!
//! Coarse routing picks, for every window, the `topk` windows whose pooled
//! keys best match its pooled query. Fine-grained attention then runs between
//! the window's pixels and the pixels of those routed windows only.

use bra_common::{BraConfig, BraError, Result, RoutingWeightMode, ShapeError};
use candle_core::{D, Tensor};
use candle_nn::VarBuilder;
use tracing::{debug, trace};

use crate::attention::WindowedAttention;
use crate::downsample::KvDownsampler;
use crate::gather::KvGather;
use crate::projection::Projection;
use crate::router::{Routing, TopkRouter};
use crate::window::{self, Extents};

/// Everything a forward pass produces
#[derive(Debug, Clone)]
pub struct BraOutput {
    /// `(n, D, H, W, dim)`, same shape as the input.
    pub output: Tensor,
    /// `(n, n_win³, topk)`
    pub routing_weights: Tensor,
    /// `(n, n_win³, topk)` u32
    pub routing_indices: Tensor,
    /// `(n·n_win³, heads, window_pixels, topk·kv_pixels)`
    pub attention_weights: Tensor,
    /// `(n, n_win³, wd, wh, ww, qk_dim)`
    pub q: Tensor,
    /// `(n, n_win³, wd, wh, ww, qk_dim)`
    pub k: Tensor,
    /// `(n, n_win³, wd, wh, ww, dim)`
    pub v: Tensor,
}

/// Bi-level routing attention over NDHWC activations
#[derive(Debug, Clone)]
pub struct BiLevelRoutingAttention {
    config: BraConfig,
    projection: Projection,
    downsampler: KvDownsampler,
    router: TopkRouter,
    gather: KvGather,
    attention: WindowedAttention,
}

impl BiLevelRoutingAttention {
    /// Builds the block, registering its parameters under `vb`.
    ///
    /// Parameters: `qkv.{weight,bias}`, `wo.{weight,bias}` (qkvo mode) and
    /// `router.emb.{weight,bias}` (param routing).
    pub fn new(config: &BraConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let weighting = config.routing_weight_mode();
        if weighting == RoutingWeightMode::Hard {
            return Err(BraError::not_implemented(
                "differentiable hard routing (diff_routing without soft_routing)",
            ));
        }
        let downsampler = KvDownsampler::from_config(config)?;
        let router = TopkRouter::from_config(config, vb.pp("router"))?;
        let projection = Projection::new(
            config.dim,
            config.qk_dim(),
            config.param_attention,
            config.qkv_bias,
            vb.clone(),
        )?;
        let attention = WindowedAttention::new(config.num_heads, config.scale())?;
        debug!(
            dim = config.dim,
            qk_dim = config.qk_dim(),
            num_heads = config.num_heads,
            n_win = config.n_win,
            topk = config.topk,
            %weighting,
            "built bi-level routing attention"
        );
        Ok(Self {
            config: config.clone(),
            projection,
            downsampler,
            router,
            gather: KvGather::new(weighting),
            attention,
        })
    }

    pub fn config(&self) -> &BraConfig {
        &self.config
    }

    pub fn downsampler(&self) -> &KvDownsampler {
        &self.downsampler
    }

    /// `(n, D, H, W, dim)` → `(n, D, H, W, dim)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_aux(x)?.output)
    }

    pub fn forward_with_aux(&self, x: &Tensor) -> Result<BraOutput> {
        let extents = self.check_input(x)?;
        let n_win = self.config.n_win;
        let dim = self.config.dim;
        let qk_dim = self.config.qk_dim();

        let (x, original) = if self.config.auto_pad {
            window::pad_to_multiple(x, n_win)?
        } else {
            extents.check_divisible(n_win)?;
            (x.clone(), extents)
        };
        let padded = original.padded_to(n_win);
        if padded != original {
            debug!(?original, ?padded, "padded input to a multiple of n_win");
        }

        let windows = window::partition(&x, n_win)?;
        let n = windows.dim(0)?;
        let p = windows.dim(1)?;
        let win = padded.window(n_win);
        let pixels = win.volume();

        let qkv = self.projection.project_qkv(&windows)?;
        let q_pix = qkv.q.reshape((n, p, pixels, qk_dim))?;

        let kv_pix = self.downsample_kv(&qkv.kv, n, p, win)?;
        trace!(q = ?q_pix.dims(), kv = ?kv_pix.dims(), "flattened window pixels");

        let q_win = q_pix.mean(2)?;
        let k_win = qkv.k.reshape((n, p, pixels, qk_dim))?.mean(2)?;
        let Routing { weights, indices } = self.router.forward(&q_win, &k_win)?;

        let selected = self.gather.forward(&indices, &weights, &kv_pix)?;
        let k_sel = selected.narrow(D::Minus1, 0, qk_dim)?.contiguous()?;
        let v_sel = selected.narrow(D::Minus1, qk_dim, dim)?.contiguous()?;

        let (out, attention_weights) = self.attention.forward(&q_pix, &k_sel, &v_sel)?;
        let out = out.reshape(&[n, p, win.depth, win.height, win.width, dim])?;
        let out = window::reassemble(&out, n_win)?;
        let out = self.projection.project_output(&out)?;
        let output = window::crop(&out, original)?;

        Ok(BraOutput {
            output,
            routing_weights: weights,
            routing_indices: indices,
            attention_weights,
            q: qkv.q,
            k: qkv.k,
            v: qkv.v,
        })
    }

    fn check_input(&self, x: &Tensor) -> Result<Extents> {
        let extents = Extents::of(x)?;
        let channels = x.dim(D::Minus1)?;
        if channels != self.config.dim {
            return Err(
                ShapeError::ChannelMismatch { expected: self.config.dim, actual: channels }.into()
            );
        }
        extents.check_non_empty()?;
        trace!(input = ?x.dims(), "bi-level routing attention forward");
        Ok(extents)
    }

    /// Downsamples windowed kv on a channel-first grid and flattens its pixels:
    /// `(n, p, wd, wh, ww, c)` → `(n, p, kv_pixels, c)`.
    fn downsample_kv(&self, kv: &Tensor, n: usize, p: usize, win: Extents) -> Result<Tensor> {
        let c = kv.dim(D::Minus1)?;
        let kv_pixels = self.downsampler.output_extents(win).volume();
        if matches!(self.downsampler, KvDownsampler::Identity) {
            return Ok(kv.reshape((n, p, kv_pixels, c))?);
        }
        let grid = kv
            .reshape((n * p, win.depth, win.height, win.width, c))?
            .permute((0, 4, 1, 2, 3))?;
        let pooled = self.downsampler.forward(&grid)?;
        Ok(pooled.permute((0, 2, 3, 4, 1))?.contiguous()?.reshape((n, p, kv_pixels, c))?)
    }
}
