//! Async resource orchestration for the stock dashboard: keystroke search,
//! streamed AI analysis and lazily loaded tabs over one entity-scoped cache.

pub mod abort;
pub mod api;
pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod decode;
pub mod error;
pub mod events;
pub mod key;
pub mod logger;
pub mod model;
pub mod orchestrator;
pub mod render;
pub mod runner;
pub mod search;
pub mod tabs;
pub mod token;

pub use cli::Args;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
