//! BluWave engine: tokio transport, discovery and session management on top
//! of the I/O-free protocol core.

pub mod config;
pub mod engine;
pub mod errors;

mod connection;
mod discovery;
mod router;

pub use config::Config;
pub use engine::ChatEngine;
pub use errors::EngineError;
