//! portal-chat client library.
//!
//! This module re-exports the core components for testing and extension.

pub mod backend;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod format;
pub mod history;
pub mod logging;
pub mod message;
pub mod protocol;
pub mod state;
pub mod timeline;
pub mod validation;

#[cfg(test)]
mod backend_tests;
