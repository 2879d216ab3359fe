// src/core/mod.rs

pub mod errors;
pub mod events;
pub mod gateway;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod router;

pub use errors::RelayError;
