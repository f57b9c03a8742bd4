//! # stockade-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire Stockade workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the container specification, lifecycle
//! state machine, and error taxonomy that all other crates build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod spec;
pub mod types;
