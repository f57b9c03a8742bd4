//! # stockade-core
//!
//! Low-level Linux isolation primitives for the Stockade runtime.
//!
//! This crate provides the four subsystems the lifecycle orchestrator
//! sequences:
//! - **Filesystem**: `OverlayFS` root preparation, teardown, and `pivot_root`.
//! - **Cgroups v2**: CPU, memory, and I/O limits plus usage accounting.
//! - **Network**: IP/veth allocation, bridge attachment, and NAT rules.
//! - **Namespaces**: PID, mount, network, user, IPC, and UTS isolation and
//!   the launch of the entry process inside them.
//!
//! The subsystems never call each other. All unsafe system calls are
//! encapsulated in safe wrappers with `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod network;
