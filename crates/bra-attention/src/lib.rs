//! Bi-level routing attention for volumetric (NDHWC) activations

pub mod attention;
pub mod block;
pub mod downsample;
pub mod gather;
pub mod projection;
pub mod router;
pub mod window;

pub use attention::WindowedAttention;
pub use block::{BiLevelRoutingAttention, BraOutput};
pub use downsample::{KvDownsampler, Reduce};
pub use gather::KvGather;
pub use projection::{OutputProjection, Projection, QkvLinear, QkvSplit};
pub use router::{Routing, TopkRouter};
pub use window::Extents;

pub use bra_common::{
    BraConfig, BraConfigBuilder, BraError, DownsampleMode, ParamAttention, Result,
    RoutingWeightMode, ShapeError,
};
