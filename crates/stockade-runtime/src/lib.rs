//! # stockade-runtime
//!
//! Container lifecycle management for the Stockade runtime.
//!
//! [`engine::Orchestrator`] owns every container record and sequences the
//! isolation subsystems of `stockade-core` through the [`backend::HostBackend`]
//! seam. Each transition is mirrored into an optional [`state::StateStore`]
//! so other processes can observe containers.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod cancel;
pub mod container;
pub mod engine;
pub mod process;
pub mod state;

pub use nix::sys::signal::Signal;
