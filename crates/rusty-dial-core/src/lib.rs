//! Core types, config, errors, conversation history and content isolation for Rusty Dial.

pub mod config;
pub mod error;
pub mod history;
pub mod isolation;
pub mod protocol;
pub mod types;
pub mod utterance;
