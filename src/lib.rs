// ConvStream - lib.rs
//
// Library entry point. The binary in `main.rs` is a thin CLI over
// `app::service::Engine`; integration tests drive the same surface.

pub mod app;
pub mod core;
pub mod platform;
pub mod util;
