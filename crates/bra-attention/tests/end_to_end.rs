//! End-to-end behaviour of the bi-level routing attention block.

use anyhow::Result;
use bra_attention::window::reassemble;
use bra_attention::{BiLevelRoutingAttention, BraConfig, BraError, DownsampleMode, ParamAttention};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

fn build(config: &BraConfig) -> bra_attention::Result<(BiLevelRoutingAttention, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let block = BiLevelRoutingAttention::new(config, vb)?;
    Ok((block, varmap))
}

fn build_error(config: &BraConfig) -> BraError {
    match build(config) {
        Ok(_) => panic!("construction should fail for {config:?}"),
        Err(err) => err,
    }
}

fn reference_config() -> BraConfig {
    BraConfig::builder()
        .dim(32)
        .num_heads(4)
        .n_win(2)
        .topk(4)
        .qk_dim(32)
        .build()
        .expect("reference configuration is valid")
}

#[test]
fn cube_of_sixteen_keeps_its_shape() -> Result<()> {
    let (block, _varmap) = build(&reference_config())?;
    let x = Tensor::randn(0f32, 1.0, (1, 16, 16, 16, 32), &Device::Cpu)?;
    let y = block.forward(&x)?;
    assert_eq!(y.dims(), &[1, 16, 16, 16, 32]);
    Ok(())
}

#[test]
fn auto_pad_handles_odd_depth() -> Result<()> {
    let mut config = reference_config();
    config.auto_pad = true;
    let (block, _varmap) = build(&config)?;
    let x = Tensor::randn(0f32, 1.0, (1, 15, 16, 16, 32), &Device::Cpu)?;
    let y = block.forward(&x)?;
    assert_eq!(y.dims(), &[1, 15, 16, 16, 32]);
    Ok(())
}

#[test]
fn odd_depth_without_auto_pad_is_rejected() -> Result<()> {
    let (block, _varmap) = build(&reference_config())?;
    let x = Tensor::zeros((1, 15, 16, 16, 32), DType::F32, &Device::Cpu)?;
    let err = block.forward(&x).unwrap_err();
    assert!(err.is_shape(), "{err}");
    assert!(err.to_string().contains("depth"));
    Ok(())
}

#[test]
fn full_topk_routes_every_window() -> Result<()> {
    let config = BraConfig::builder().dim(8).num_heads(2).n_win(2).topk(8).build()?;
    let (block, _varmap) = build(&config)?;
    let x = Tensor::randn(0f32, 1.0, (2, 4, 4, 4, 8), &Device::Cpu)?;
    let aux = block.forward_with_aux(&x)?;
    for mut row in aux.routing_indices.flatten_to(1)?.to_vec2::<u32>()? {
        row.sort_unstable();
        assert_eq!(row, (0..8).collect::<Vec<u32>>());
    }
    Ok(())
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

#[test]
fn full_topk_matches_dense_attention() -> Result<()> {
    let config = BraConfig::builder()
        .dim(8)
        .num_heads(2)
        .n_win(2)
        .topk(8)
        .param_attention(ParamAttention::Qkv)
        .build()?;
    let (block, _varmap) = build(&config)?;
    let x = Tensor::randn(0f32, 1.0, (2, 4, 4, 4, 8), &Device::Cpu)?;
    let aux = block.forward_with_aux(&x)?;

    // plain multi-head attention over every pixel of the volume
    let heads = config.num_heads;
    let split_heads = |windows: &Tensor| -> Result<Tensor> {
        let width = windows.dim(D::Minus1)?;
        Ok(reassemble(windows, config.n_win)?
            .reshape((2, 64, heads, width / heads))?
            .transpose(1, 2)?
            .contiguous()?)
    };
    let q = split_heads(&aux.q)?;
    let k = split_heads(&aux.k)?;
    let v = split_heads(&aux.v)?;
    let attn = candle_nn::ops::softmax(&(q * config.scale())?.matmul(&k.t()?)?, D::Minus1)?;
    let dense = attn.matmul(&v)?.transpose(1, 2)?.contiguous()?.reshape((2, 4, 4, 4, 8))?;

    let diff = max_abs_diff(&aux.output, &dense)?;
    assert!(diff < 1e-5, "max difference {diff}");
    Ok(())
}

#[test]
fn batch_items_are_independent() -> Result<()> {
    let config = BraConfig::builder()
        .dim(8)
        .num_heads(2)
        .n_win(2)
        .topk(3)
        .soft_routing(true)
        .build()?;
    let (block, _varmap) = build(&config)?;
    let x = Tensor::randn(0f32, 1.0, (2, 4, 4, 4, 8), &Device::Cpu)?;
    let batched = block.forward(&x)?.narrow(0, 1, 1)?;
    let alone = block.forward(&x.narrow(0, 1, 1)?)?;
    let diff = max_abs_diff(&batched, &alone)?;
    assert!(diff < 1e-6, "max difference {diff}");
    Ok(())
}

#[test]
fn unit_ratio_pooling_matches_identity() -> Result<()> {
    let identity = BraConfig::builder().dim(8).num_heads(2).n_win(2).topk(2).build()?;
    let mut pooled = identity.clone();
    pooled.kv_downsample_mode = DownsampleMode::MaxPool;
    pooled.kv_downsample_ratio = 1;

    // same parameters for both blocks
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let a = BiLevelRoutingAttention::new(&identity, vb.clone())?;
    let b = BiLevelRoutingAttention::new(&pooled, vb)?;

    let x = Tensor::randn(0f32, 1.0, (1, 4, 4, 4, 8), &Device::Cpu)?;
    let diff = (a.forward(&x)? - b.forward(&x)?)?.abs()?.flatten_all()?.max(0)?;
    assert!(diff.to_scalar::<f32>()? < 1e-6);
    Ok(())
}

#[test]
fn adaptive_pooling_runs_end_to_end() -> Result<()> {
    for mode in [DownsampleMode::AdaAvgPool, DownsampleMode::AdaMaxPool] {
        let config = BraConfig::builder()
            .dim(8)
            .num_heads(2)
            .n_win(2)
            .topk(2)
            .kv_downsample_mode(mode)
            .kv_per_win(2)
            .build()?;
        let (block, _varmap) = build(&config)?;
        let x = Tensor::randn(0f32, 1.0, (1, 6, 6, 6, 8), &Device::Cpu)?;
        let aux = block.forward_with_aux(&x)?;
        assert_eq!(aux.output.dims(), x.dims());
        // 2 routed windows × 2³ pooled pixels
        assert_eq!(aux.attention_weights.dims(), &[8, 2, 27, 16]);
    }
    Ok(())
}

#[test]
fn pooling_ratio_larger_than_window_is_shape_error() -> Result<()> {
    let config = BraConfig::builder()
        .dim(8)
        .num_heads(2)
        .n_win(2)
        .topk(2)
        .kv_downsample_mode(DownsampleMode::AvgPool)
        .kv_downsample_ratio(4)
        .build()?;
    let (block, _varmap) = build(&config)?;
    let x = Tensor::zeros((1, 4, 4, 4, 8), DType::F32, &Device::Cpu)?;
    assert!(block.forward(&x).unwrap_err().is_shape());
    Ok(())
}

#[test]
fn construction_errors_are_classified() {
    let err = "invalid".parse::<ParamAttention>().unwrap_err();
    assert!(matches!(err, BraError::Config(_)));

    let mut config = reference_config();
    config.param_routing = true;
    assert!(build_error(&config).is_config());

    let mut config = reference_config();
    config.kv_downsample_mode = DownsampleMode::Conv;
    assert!(build_error(&config).is_not_implemented());

    let mut config = reference_config();
    config.kv_downsample_mode = DownsampleMode::FracPool;
    assert!(build_error(&config).is_not_implemented());
}

#[test]
fn routing_gradient_follows_diff_routing() -> Result<()> {
    let base = BraConfig::builder().dim(8).num_heads(2).n_win(2).topk(2).soft_routing(true);

    for (diff_routing, expect_grad) in [(false, false), (true, true)] {
        let config = base.clone().diff_routing(diff_routing).build()?;
        let (block, varmap) = build(&config)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 4, 4, 8), &Device::Cpu)?;
        let aux = block.forward_with_aux(&x)?;

        let loss = aux.routing_weights.sqr()?.sum_all()?;
        let grads = loss.backward()?;
        let qkv_weight = varmap
            .data()
            .lock()
            .unwrap()
            .get("qkv.weight")
            .cloned()
            .expect("qkv weight is registered");
        let has_grad = grads.get(qkv_weight.as_tensor()).is_some();
        assert_eq!(has_grad, expect_grad, "diff_routing={diff_routing}");
    }
    Ok(())
}

#[test]
fn output_depends_on_projection_weights() -> Result<()> {
    let config = BraConfig::builder().dim(8).num_heads(2).n_win(2).topk(2).build()?;
    let (block, varmap) = build(&config)?;
    let x = Tensor::randn(0f32, 1.0, (1, 4, 4, 4, 8), &Device::Cpu)?;
    let loss = block.forward(&x)?.sqr()?.sum_all()?;
    let grads = loss.backward()?;
    for (name, var) in varmap.data().lock().unwrap().iter() {
        assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
    }
    Ok(())
}

#[test]
fn block_is_shareable_across_threads() -> Result<()> {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<BiLevelRoutingAttention>();

    let config = BraConfig::builder().dim(8).num_heads(2).n_win(2).topk(2).build()?;
    let (block, _varmap) = build(&config)?;
    let x = Tensor::randn(0f32, 1.0, (1, 4, 4, 4, 8), &Device::Cpu)?;
    let expected = block.forward(&x)?;
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2).map(|_| scope.spawn(|| block.forward(&x))).collect();
        for handle in handles {
            let y = handle.join().expect("forward thread panicked").expect("forward succeeds");
            let diff = (y - &expected).unwrap().abs().unwrap().sum_all().unwrap();
            assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        }
    });
    Ok(())
}
