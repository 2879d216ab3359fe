// src/core/protocol/mod.rs

mod frame;

pub use frame::{Message, MessageCodec, SYSTEM_SENDER};
