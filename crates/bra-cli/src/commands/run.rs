//! Forward pass on random input

use anyhow::{Context, Result, bail};
use bra_attention::BiLevelRoutingAttention;
use bra_common::BraConfig;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use console::style;
use serde_json::json;
use std::str::FromStr;
use std::time::Instant;
use tracing::info;

use super::OutputFormat;

/// NDHWC input shape written as `NxDxHxWxC`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape(pub [usize; 5]);

impl FromStr for InputShape {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split(['x', 'X'])
            .map(|part| {
                part.trim().parse::<usize>().with_context(|| format!("invalid extent '{part}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        let Ok(dims) = <[usize; 5]>::try_from(parts.as_slice()) else {
            bail!("expected 5 extents (NxDxHxWxC), got {}", parts.len());
        };
        if dims.contains(&0) {
            bail!("extents must be positive, got {s}");
        }
        Ok(Self(dims))
    }
}

/// Run a forward pass with freshly initialised parameters
#[derive(Debug, Parser)]
pub struct RunCommand {
    /// Input shape as NxDxHxWxC; C must equal the configured dim
    #[arg(short, long, value_name = "SHAPE")]
    pub shape: InputShape,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl RunCommand {
    pub fn execute(self, config: &BraConfig) -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = BiLevelRoutingAttention::new(config, vb)
            .context("Failed to build attention block")?;

        let input = Tensor::randn(0f32, 1.0, &self.shape.0, &device)?;
        info!("Running forward pass on input {:?}", input.dims());

        let start = Instant::now();
        let aux = block.forward_with_aux(&input).context("Forward pass failed")?;
        let elapsed = start.elapsed();

        let indices = aux.routing_indices.get(0)?.to_vec2::<u32>()?;
        let weights = aux.routing_weights.get(0)?.to_vec2::<f32>()?;

        match self.format {
            OutputFormat::Json => {
                let routing: Vec<_> = indices
                    .iter()
                    .zip(&weights)
                    .enumerate()
                    .map(|(window, (idx, w))| {
                        json!({ "window": window, "indices": idx, "weights": w })
                    })
                    .collect();
                let report = json!({
                    "input_shape": input.dims(),
                    "output_shape": aux.output.dims(),
                    "elapsed_ms": elapsed.as_secs_f64() * 1e3,
                    "downsampler": format!("{:?}", block.downsampler()),
                    "routing": routing,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Text => {
                println!("{}", style("Bi-level routing attention").bold().cyan());
                println!("  Input shape:  {:?}", input.dims());
                println!("  Output shape: {:?}", aux.output.dims());
                println!("  Elapsed:      {:.2} ms", elapsed.as_secs_f64() * 1e3);
                println!();
                println!("{}", style("Routing (batch 0):").bold());
                for (window, (idx, w)) in indices.iter().zip(&weights).enumerate() {
                    let weights: Vec<String> = w.iter().map(|v| format!("{v:.3}")).collect();
                    println!("  window {window:>4} -> {idx:?} [{}]", weights.join(", "));
                }
            }
        }
        Ok(())
    }
}
