//! # proxima-node
//!
//! Node service library: shared state, logging setup and the read-only
//! status API over the presence pipeline.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
