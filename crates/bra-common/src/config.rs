//! Configuration types and utilities

use crate::{BraError, DownsampleMode, ParamAttention, Result, RoutingWeightMode};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::debug;


/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "BRA_";

/// Construction-time configuration of a bi-level routing attention block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BraConfig {
    /// Number of windows each query window attends to.
    pub topk: usize,
    /// Input, value and output channel width.
    pub dim: usize,
    pub num_heads: usize,
    /// Windows per spatial side; the block sees `n_win³` windows.
    pub n_win: usize,
    /// Query/key channel width, defaults to `dim`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qk_dim: Option<usize>,
    /// Softmax temperature, defaults to `qk_dim^-0.5`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qk_scale: Option<f64>,
    /// Target key/value pixels per side for the adaptive pooling modes.
    pub kv_per_win: usize,
    /// Pooling ratio for the fixed-ratio pooling modes.
    pub kv_downsample_ratio: usize,
    pub kv_downsample_mode: DownsampleMode,
    pub param_attention: ParamAttention,
    pub param_routing: bool,
    pub diff_routing: bool,
    pub soft_routing: bool,
    pub auto_pad: bool,
    pub qkv_bias: bool,
}

impl Default for BraConfig {
    fn default() -> Self {
        Self {
            topk: 4,
            dim: 64,
            num_heads: 8,
            n_win: 7,
            qk_dim: None,
            qk_scale: None,
            kv_per_win: 4,
            kv_downsample_ratio: 4,
            kv_downsample_mode: DownsampleMode::Identity,
            param_attention: ParamAttention::Qkvo,
            param_routing: false,
            diff_routing: false,
            soft_routing: false,
            auto_pad: false,
            qkv_bias: true,
        }
    }
}

impl BraConfig {
    pub fn builder() -> BraConfigBuilder {
        BraConfigBuilder::new()
    }

    /// Query/key channel width after applying the `dim` fallback.
    pub fn qk_dim(&self) -> usize {
        self.qk_dim.unwrap_or(self.dim)
    }

    /// Attention temperature after applying the `qk_dim^-0.5` fallback.
    pub fn scale(&self) -> f64 {
        self.qk_scale.unwrap_or_else(|| (self.qk_dim() as f64).powf(-0.5))
    }

    /// Total number of windows, `n_win³`.
    pub fn num_windows(&self) -> usize {
        self.n_win.pow(3)
    }

    pub fn routing_weight_mode(&self) -> RoutingWeightMode {
        RoutingWeightMode::from_flags(self.soft_routing, self.diff_routing)
    }

    /// Load configuration from a TOML or JSON file, selected by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => {
                return Err(BraError::config(format!(
                    "Unsupported config file format: {}",
                    path.display()
                )));
            }
        };
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Defaults with `BRA_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults, then the optional file, then environment overrides, validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BRA_*` environment overrides to this configuration.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<usize>("TOPK")? {
            self.topk = v;
        }
        if let Some(v) = env_parse::<usize>("DIM")? {
            self.dim = v;
        }
        if let Some(v) = env_parse::<usize>("NUM_HEADS")? {
            self.num_heads = v;
        }
        if let Some(v) = env_parse::<usize>("N_WIN")? {
            self.n_win = v;
        }
        if let Some(v) = env_parse::<usize>("QK_DIM")? {
            self.qk_dim = Some(v);
        }
        if let Some(v) = env_parse::<f64>("QK_SCALE")? {
            self.qk_scale = Some(v);
        }
        if let Some(v) = env_parse::<usize>("KV_PER_WIN")? {
            self.kv_per_win = v;
        }
        if let Some(v) = env_parse::<usize>("KV_DOWNSAMPLE_RATIO")? {
            self.kv_downsample_ratio = v;
        }
        if let Some(v) = env_var("KV_DOWNSAMPLE_MODE") {
            self.kv_downsample_mode = v.parse()?;
        }
        if let Some(v) = env_var("PARAM_ATTENTION") {
            self.param_attention = v.parse()?;
        }
        if let Some(v) = env_bool("PARAM_ROUTING")? {
            self.param_routing = v;
        }
        if let Some(v) = env_bool("DIFF_ROUTING")? {
            self.diff_routing = v;
        }
        if let Some(v) = env_bool("SOFT_ROUTING")? {
            self.soft_routing = v;
        }
        if let Some(v) = env_bool("AUTO_PAD")? {
            self.auto_pad = v;
        }
        if let Some(v) = env_bool("QKV_BIAS")? {
            self.qkv_bias = v;
        }
        Ok(())
    }

    /// Check internal consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(BraError::config("dim must be greater than 0"));
        }
        if self.num_heads == 0 {
            return Err(BraError::config("num_heads must be greater than 0"));
        }
        if self.n_win == 0 {
            return Err(BraError::config("n_win must be greater than 0"));
        }
        let qk_dim = self.qk_dim();
        if qk_dim == 0 {
            return Err(BraError::config("qk_dim must be greater than 0"));
        }
        if !qk_dim.is_multiple_of(self.num_heads) || !self.dim.is_multiple_of(self.num_heads) {
            return Err(BraError::config(format!(
                "qk_dim ({qk_dim}) and dim ({}) must be divisible by num_heads ({})",
                self.dim, self.num_heads
            )));
        }
        if self.topk == 0 || self.topk > self.num_windows() {
            return Err(BraError::config(format!(
                "topk must be in 1..={} for n_win={}, got {}",
                self.num_windows(),
                self.n_win,
                self.topk
            )));
        }
        if let Some(scale) = self.qk_scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(BraError::config(format!(
                    "qk_scale must be finite and positive, got {scale}"
                )));
            }
        }
        if self.kv_per_win == 0 {
            return Err(BraError::config("kv_per_win must be greater than 0"));
        }
        if self.kv_downsample_ratio == 0 {
            return Err(BraError::config("kv_downsample_ratio must be greater than 0"));
        }
        if self.param_routing && !self.diff_routing {
            return Err(BraError::config("param_routing requires diff_routing to be enabled"));
        }
        Ok(())
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}")).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_var(key) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            BraError::config(format!("Invalid value for {ENV_PREFIX}{key}: '{raw}'"))
        }),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match env_var(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(BraError::config(format!("Invalid boolean for {ENV_PREFIX}{key}: '{raw}'"))),
        },
        None => Ok(None),
    }
}

/// Fluent builder for [`BraConfig`]; `build` validates
#[derive(Debug, Clone, Default)]
pub struct BraConfigBuilder {
    config: BraConfig,
}

impl BraConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topk(mut self, topk: usize) -> Self {
        self.config.topk = topk;
        self
    }

    pub fn dim(mut self, dim: usize) -> Self {
        self.config.dim = dim;
        self
    }

    pub fn num_heads(mut self, num_heads: usize) -> Self {
        self.config.num_heads = num_heads;
        self
    }

    pub fn n_win(mut self, n_win: usize) -> Self {
        self.config.n_win = n_win;
        self
    }

    pub fn qk_dim(mut self, qk_dim: usize) -> Self {
        self.config.qk_dim = Some(qk_dim);
        self
    }

    pub fn qk_scale(mut self, qk_scale: f64) -> Self {
        self.config.qk_scale = Some(qk_scale);
        self
    }

    pub fn kv_per_win(mut self, kv_per_win: usize) -> Self {
        self.config.kv_per_win = kv_per_win;
        self
    }

    pub fn kv_downsample_ratio(mut self, ratio: usize) -> Self {
        self.config.kv_downsample_ratio = ratio;
        self
    }

    pub fn kv_downsample_mode(mut self, mode: DownsampleMode) -> Self {
        self.config.kv_downsample_mode = mode;
        self
    }

    pub fn param_attention(mut self, mode: ParamAttention) -> Self {
        self.config.param_attention = mode;
        self
    }

    pub fn param_routing(mut self, enabled: bool) -> Self {
        self.config.param_routing = enabled;
        self
    }

    pub fn diff_routing(mut self, enabled: bool) -> Self {
        self.config.diff_routing = enabled;
        self
    }

    pub fn soft_routing(mut self, enabled: bool) -> Self {
        self.config.soft_routing = enabled;
        self
    }

    pub fn auto_pad(mut self, enabled: bool) -> Self {
        self.config.auto_pad = enabled;
        self
    }

    pub fn qkv_bias(mut self, enabled: bool) -> Self {
        self.config.qkv_bias = enabled;
        self
    }

    pub fn build(self) -> Result<BraConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Returns the configuration without validating it.
    pub fn build_unchecked(self) -> BraConfig {
        self.config
    }
}
