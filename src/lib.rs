//! voice-pilot: voice-driven coding assistant core.

pub mod agents;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod plan;
pub mod realtime;
pub mod store;
