// ConvStream - core/mod.rs
//
// Core business logic layer: data model, parsing, filtering, topic matching,
// analyzers, detection math, file discovery and export.
// Must NOT depend on: platform or app. No threads.

pub mod analyzers;
pub mod anomaly;
pub mod discovery;
pub mod export;
pub mod filter;
pub mod model;
pub mod parser;
pub mod topic;
