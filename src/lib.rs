//! Strongroom - lifecycle-safe client orchestration for background vault
//! mutations.
//!
//! A foreground UI embeds a [`client::TaskClient`] to dispatch long-running
//! mutating commands (create/update/move/delete records, change security
//! settings, save) to a background worker process, and to mirror that
//! worker's progress and conflict state back into singleton, recreation-safe
//! UI surfaces. The client survives UI teardown and recreation without
//! losing an in-flight command, duplicating progress indicators, or leaking
//! listener registrations.

pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod signal;
pub mod surface;
pub mod worker;

pub use error::{Result, StrongroomError};
