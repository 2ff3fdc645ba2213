//! Library surface of `cdevd`, the host-side event router.
//!
//! The binary in `main.rs` is a thin wrapper; exposing the router as a
//! library keeps the state machine testable over socket pairs.

pub mod cgroups;
pub mod client;
pub mod router;

pub use client::{Client, WorkItem};
pub use router::Router;
