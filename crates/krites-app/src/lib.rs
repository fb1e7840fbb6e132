//! Datasheet review backend: per-site downloads, LLM spec extraction, and
//! reconciliation of extracted specifications into human-verified model
//! records.

pub mod config;
pub mod db;
pub mod error;
pub mod paths;
pub mod pipeline;
pub mod services;
