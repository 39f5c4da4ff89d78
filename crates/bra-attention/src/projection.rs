//! Query/key/value and output projections

use bra_common::{ParamAttention, Result};
use candle_core::{D, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use tracing::debug;

/// Applies a linear layer over the last axis of a tensor of any rank.
pub(crate) fn linear_nd(layer: &Linear, x: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let Some((&channels, lead)) = dims.split_last() else {
        return Ok(layer.forward(x)?);
    };
    let rows: usize = lead.iter().product();
    let y = layer.forward(&x.reshape((rows, channels))?)?;
    let mut out_dims = lead.to_vec();
    out_dims.push(y.dim(1)?);
    Ok(y.reshape(out_dims)?)
}

/// Per-window projections produced by [`QkvLinear::forward`]
#[derive(Debug, Clone)]
pub struct QkvSplit {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// `cat(k, v)` along channels, the tensor the gatherer indexes.
    pub kv: Tensor,
}

/// Single affine map `dim → 2·qk_dim + dim` split into q, k and v
#[derive(Debug, Clone)]
pub struct QkvLinear {
    qkv: Linear,
    dim: usize,
    qk_dim: usize,
}

impl QkvLinear {
    pub fn new(dim: usize, qk_dim: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        let qkv = candle_nn::linear_b(dim, 2 * qk_dim + dim, bias, vb)?;
        Ok(Self { qkv, dim, qk_dim })
    }

    pub fn forward(&self, x: &Tensor) -> Result<QkvSplit> {
        let qkv = linear_nd(&self.qkv, x)?;
        let q = qkv.narrow(D::Minus1, 0, self.qk_dim)?.contiguous()?;
        let kv = qkv.narrow(D::Minus1, self.qk_dim, self.qk_dim + self.dim)?.contiguous()?;
        let k = kv.narrow(D::Minus1, 0, self.qk_dim)?.contiguous()?;
        let v = kv.narrow(D::Minus1, self.qk_dim, self.dim)?.contiguous()?;
        Ok(QkvSplit { q, k, v, kv })
    }
}

/// Output transform resolved from [`ParamAttention`]
#[derive(Debug, Clone)]
pub enum OutputProjection {
    Linear(Linear),
    Identity,
}

impl OutputProjection {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Linear(layer) => linear_nd(layer, x),
            Self::Identity => Ok(x.clone()),
        }
    }
}

/// Input and output projections of the attention block
#[derive(Debug, Clone)]
pub struct Projection {
    qkv: QkvLinear,
    output: OutputProjection,
}

impl Projection {
    pub fn new(
        dim: usize,
        qk_dim: usize,
        mode: ParamAttention,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let qkv = QkvLinear::new(dim, qk_dim, bias, vb.pp("qkv"))?;
        let output = match mode {
            ParamAttention::Qkvo => {
                OutputProjection::Linear(candle_nn::linear(dim, dim, vb.pp("wo"))?)
            }
            ParamAttention::Qkv => OutputProjection::Identity,
        };
        debug!(%mode, dim, qk_dim, bias, "built attention projections");
        Ok(Self { qkv, output })
    }

    pub fn project_qkv(&self, x: &Tensor) -> Result<QkvSplit> {
        self.qkv.forward(x)
    }

    pub fn project_output(&self, x: &Tensor) -> Result<Tensor> {
        self.output.forward(x)
    }

    pub fn output(&self) -> &OutputProjection {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn qkv_split_widths() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let proj = QkvLinear::new(12, 8, true, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, &[2, 3, 2, 2, 2, 12], &Device::Cpu).unwrap();
        let split = proj.forward(&x).unwrap();
        assert_eq!(split.q.dims(), &[2, 3, 2, 2, 2, 8]);
        assert_eq!(split.k.dims(), &[2, 3, 2, 2, 2, 8]);
        assert_eq!(split.v.dims(), &[2, 3, 2, 2, 2, 12]);
        assert_eq!(split.kv.dims(), &[2, 3, 2, 2, 2, 20]);

        let rebuilt = Tensor::cat(&[&split.k, &split.v], D::Minus1).unwrap();
        let diff = (rebuilt - &split.kv).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn qkv_mode_uses_identity_output() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let proj = Projection::new(8, 8, ParamAttention::Qkv, true, vb).unwrap();
        assert!(matches!(proj.output(), OutputProjection::Identity));
        let x = Tensor::randn(0f32, 1.0, &[1, 2, 2, 2, 8], &Device::Cpu).unwrap();
        let y = proj.project_output(&x).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        // only the qkv weights were registered
        assert_eq!(varmap.all_vars().len(), 2);
    }

    #[test]
    fn qkvo_mode_registers_output_weights() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let proj = Projection::new(8, 4, ParamAttention::Qkvo, false, vb).unwrap();
        assert!(matches!(proj.output(), OutputProjection::Linear(_)));
        // qkv weight (no bias) + wo weight + wo bias
        assert_eq!(varmap.all_vars().len(), 3);
        let x = Tensor::randn(0f32, 1.0, &[1, 2, 2, 2, 8], &Device::Cpu).unwrap();
        assert_eq!(proj.project_output(&x).unwrap().dims(), x.dims());
    }

    #[test]
    fn linear_nd_matches_flat_application() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = candle_nn::linear(4, 3, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, &[2, 5, 4], &Device::Cpu).unwrap();
        let nd = linear_nd(&layer, &x).unwrap();
        let flat = layer.forward(&x.reshape((10, 4)).unwrap()).unwrap().reshape((2, 5, 3)).unwrap();
        let diff = (nd - flat).unwrap().abs().unwrap().max_keepdim(0).unwrap();
        let max = diff.flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(max < 1e-6);
    }
}
