//! CLI commands

pub mod context;
pub mod run;
pub mod style;

pub use run::{RunOptions, check_config, run_bot};
