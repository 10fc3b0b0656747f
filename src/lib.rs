//! Vulkan bootstrap: instance, device selection, logical device with queues,
//! and a presentation ring, each negotiated from required and requested
//! capabilities.

pub mod backend;
pub mod config;

pub use backend::*;
