// src/lib.rs
pub mod config;
pub mod utils;
pub mod orchestrator;
pub mod pipelines;
pub mod cli;
pub use cli::{Arguments, Command};
