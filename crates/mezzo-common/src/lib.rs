//! # mezzo-common
//!
//! Shared foundation for all Mezzo services: the error taxonomy used at
//! every handler boundary and the application configuration.

pub mod config;
pub mod error;

pub use error::{MezzoError, MezzoResult};
