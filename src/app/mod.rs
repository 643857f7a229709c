// ConvStream - app/mod.rs
//
// Runtime layer: the long-lived components, their threads, and the engine
// facade that wires them together.

pub mod bus;
pub mod cache;
pub mod detector;
pub mod health;
pub mod pipeline;
pub mod positions;
pub mod service;
pub mod tail;
