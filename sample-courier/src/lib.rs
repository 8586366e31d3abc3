pub mod cli;
pub mod commands;
pub mod load_config;
pub mod webapi;

pub use cli::{run, Cli, Commands};
