//! Horoscope streaming server with dynamic request batching - Library exports for testing
//!
//! (c) Softlandia 2025

pub mod api;
pub mod core;
pub mod infrastructure;
pub mod settings;
