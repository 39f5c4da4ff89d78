//! Supported modes and their status

use anyhow::Result;
use bra_common::{DownsampleMode, ParamAttention, RoutingWeightMode};
use clap::Parser;
use console::style;
use serde_json::json;

use super::OutputFormat;

/// List downsample, projection and routing modes
#[derive(Debug, Parser)]
pub struct InfoCommand {
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl InfoCommand {
    pub fn execute(self) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let report = json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "kv_downsample_mode": DownsampleMode::ALL
                        .map(|m| json!({ "name": m.as_str(), "implemented": m.is_implemented() })),
                    "param_attention": ParamAttention::ALL.map(|m| json!({
                        "name": m.as_str(),
                        "output_projection": m.has_output_projection(),
                    })),
                    "routing_weight": RoutingWeightMode::ALL
                        .map(|m| json!({ "name": m.as_str(), "implemented": m.is_implemented() })),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Text => {
                println!("{}", style("BRA System Information").bold().cyan());
                println!("  Version: {}", env!("CARGO_PKG_VERSION"));
                println!();

                println!("{}", style("Key/value downsample modes:").bold());
                for mode in DownsampleMode::ALL {
                    println!("  {:<12} {}", mode.as_str(), status(mode.is_implemented()));
                }
                println!();

                println!("{}", style("Projection modes:").bold());
                for mode in ParamAttention::ALL {
                    let output = if mode.has_output_projection() { "learned" } else { "identity" };
                    println!("  {:<12} output projection: {output}", mode.as_str());
                }
                println!();

                println!("{}", style("Routing weight modes:").bold());
                for mode in RoutingWeightMode::ALL {
                    println!("  {:<12} {}", mode.as_str(), status(mode.is_implemented()));
                }
            }
        }
        Ok(())
    }
}

fn status(implemented: bool) -> console::StyledObject<&'static str> {
    if implemented { style("✓ implemented").green() } else { style("✗ not implemented").red() }
}
