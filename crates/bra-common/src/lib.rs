//! Common types for bi-level routing attention
//!
//! This crate holds the pieces shared by the attention layers and the CLI:
//! the serde-backed block configuration, the typed mode enums it is built
//! from, and the error taxonomy every fallible operation returns.

pub mod config;
pub mod error;
pub mod modes;

pub use config::*;
pub use error::*;
pub use modes::*;
