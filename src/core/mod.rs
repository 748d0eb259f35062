//! Request batching, inference and result delivery.

pub mod batcher;
pub mod context;
pub mod delivery;
pub mod error;
pub mod horoscope;
pub mod message;
pub mod publisher;
pub mod traits;
pub mod worker;
