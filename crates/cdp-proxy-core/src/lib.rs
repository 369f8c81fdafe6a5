//! Shared types for the CDP browser proxy: error taxonomy, wire shapes,
//! event emitters, collaborator traits, config, and logging bootstrap.

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod protocol;
pub mod target;
