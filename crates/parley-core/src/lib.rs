//! Core types, config, errors, and wire protocol for Parley.

pub mod config;
pub mod error;
pub mod frame;
pub mod history;
pub mod protocol;
