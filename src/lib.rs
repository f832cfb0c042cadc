//! genqueue: resource-aware job scheduling core for generative pipelines.

pub mod backend;
pub mod callbacks;
pub mod compiler;
pub mod config;
pub mod error;
pub mod pool;
pub mod scheduler;
pub mod steps;
pub mod vars;
