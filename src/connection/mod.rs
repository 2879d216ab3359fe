// src/connection/mod.rs

mod client;
mod manager;

pub use client::ClientConnection;
pub use manager::{ConnectionManager, IncomingMessage};
