//! CLI command implementations

pub mod info;
pub mod run;

pub use info::InfoCommand;
pub use run::RunCommand;

use clap::ValueEnum;

/// Report format shared by the commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
