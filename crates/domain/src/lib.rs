//! Shared domain types for the workgrid control plane.
//!
//! Everything that crosses a crate boundary lives here: the session/task/log
//! data model, the worker and duplex wire frames, the configuration tree, and
//! the shared error type.

pub mod config;
pub mod error;
pub mod event;
pub mod model;

pub use error::{Error, Result};
