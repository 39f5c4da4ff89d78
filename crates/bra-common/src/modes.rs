//! Named modes accepted by the block configuration
//!
//! Every mode is parsed through [`FromStr`], including the serde path, so an
//! unknown name is reported as [`BraError::Config`] regardless of whether it
//! came from a builder call, a config file, or an environment variable.

use crate::{BraError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Key/value downsampling policy applied inside each window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DownsampleMode {
    Identity,
    AvgPool,
    MaxPool,
    AdaAvgPool,
    AdaMaxPool,
    /// Recognized but not implemented.
    FracPool,
    /// Recognized but not implemented.
    Conv,
}

impl DownsampleMode {
    pub const ALL: [DownsampleMode; 7] = [
        Self::Identity,
        Self::AvgPool,
        Self::MaxPool,
        Self::AdaAvgPool,
        Self::AdaMaxPool,
        Self::FracPool,
        Self::Conv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::AvgPool => "avgpool",
            Self::MaxPool => "maxpool",
            Self::AdaAvgPool => "ada_avgpool",
            Self::AdaMaxPool => "ada_maxpool",
            Self::FracPool => "fracpool",
            Self::Conv => "conv",
        }
    }

    pub fn is_implemented(&self) -> bool {
        !matches!(self, Self::FracPool | Self::Conv)
    }
}

impl FromStr for DownsampleMode {
    type Err = BraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" => Ok(Self::Identity),
            "avgpool" => Ok(Self::AvgPool),
            "maxpool" => Ok(Self::MaxPool),
            "ada_avgpool" => Ok(Self::AdaAvgPool),
            "ada_maxpool" => Ok(Self::AdaMaxPool),
            "fracpool" => Ok(Self::FracPool),
            "conv" => Ok(Self::Conv),
            other => Err(BraError::config(format!(
                "kv_downsample_mode '{other}' is not supported"
            ))),
        }
    }
}

impl TryFrom<String> for DownsampleMode {
    type Error = BraError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DownsampleMode> for String {
    fn from(mode: DownsampleMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for DownsampleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which affine maps carry learned parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ParamAttention {
    /// Learned q/k/v projection and learned output projection.
    Qkvo,
    /// Learned q/k/v projection, identity output.
    Qkv,
}

impl ParamAttention {
    pub const ALL: [ParamAttention; 2] = [Self::Qkvo, Self::Qkv];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qkvo => "qkvo",
            Self::Qkv => "qkv",
        }
    }

    pub fn has_output_projection(&self) -> bool {
        matches!(self, Self::Qkvo)
    }
}

impl FromStr for ParamAttention {
    type Err = BraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "qkvo" => Ok(Self::Qkvo),
            "qkv" => Ok(Self::Qkv),
            other => Err(BraError::config(format!(
                "param_attention mode '{other}' is not supported"
            ))),
        }
    }
}

impl TryFrom<String> for ParamAttention {
    type Error = BraError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ParamAttention> for String {
    fn from(mode: ParamAttention) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for ParamAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How gathered key/value blocks are weighted by their routing score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingWeightMode {
    /// Plain copy.
    None,
    /// Scale each selected block by its routing weight.
    Soft,
    /// Differentiable hard routing. Not implemented.
    Hard,
}

impl RoutingWeightMode {
    pub const ALL: [RoutingWeightMode; 3] = [Self::None, Self::Soft, Self::Hard];

    /// Derives the weighting mode from the routing flags.
    ///
    /// Soft routing takes precedence; differentiable routing without soft
    /// weighting selects the hard mode.
    pub fn from_flags(soft_routing: bool, diff_routing: bool) -> Self {
        if soft_routing {
            Self::Soft
        } else if diff_routing {
            Self::Hard
        } else {
            Self::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }

    pub fn is_implemented(&self) -> bool {
        !matches!(self, Self::Hard)
    }
}

impl fmt::Display for RoutingWeightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
