// ConvStream - platform/mod.rs
//
// Platform abstraction layer: config/data directory resolution, config file
// loading, and the file primitives the tailer and position store rely on.
// Dependencies: standard library, directories, serde, toml.
// Must NOT depend on: app.

pub mod config;
pub mod fs;
