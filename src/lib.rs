#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod agent;
pub mod cli;
pub mod codegen;
pub mod config;
pub mod error;
pub mod mcp;
pub mod sandbox;
pub mod session;
pub mod tool;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
