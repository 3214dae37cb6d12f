//! kvsd Common Library
//!
//! Shared constants, server configuration and key matching utilities for
//! all kvsd workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - System-wide limits and default paths/ports
//! - [`config`] - Server configuration with validation
//! - [`protocol`] - Wire-level response vocabulary
//! - [`wildcard`] - Glob-style key matching (`?` and `*`)

pub mod config;
pub mod consts;
pub mod protocol;
pub mod wildcard;

pub use config::{ConfigError, ServerConfig};
pub use wildcard::{contains_wildcard, match_wildcard};
