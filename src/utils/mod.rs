//! Shared utilities and error types

pub mod error;

pub use error::{ContractViolation, PolicyError, Result};
