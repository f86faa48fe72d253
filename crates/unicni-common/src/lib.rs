//! # unicni-common
//!
//! Shared types for the unicni plugin:
//! - Common error type
//! - Plugin configuration and defaults

#![warn(missing_docs)]

pub mod config;
pub mod error;

pub use config::NetConf;
pub use error::{UnicniError, UnicniResult};
