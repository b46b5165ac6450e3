//! Render job queue, local asset server and frame decode gateway backing the
//! renderq studio.

pub mod api;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod job;
pub mod logging;
pub mod port;
pub mod queue;
pub mod runner;
pub mod server;
