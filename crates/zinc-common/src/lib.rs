//! ZincServer Common - Shared types and utilities
//!
//! This crate provides the error definitions, the flat configuration map
//! (`VarMap`), the monotonic timestamp source and checksum helpers used by
//! the storage engine and the server.

pub mod checksum;
pub mod config;
pub mod error;
pub mod time;

pub use config::{ConfigError, ConfigValue, DatastoreConfigSnapshot, JsonEntrySource, VarMap};
pub use error::{Error, Result};
