//! # strata
//!
//! The runtime half of the strata ingestion pipeline. `strata-core` owns
//! identity, regulation and staged state; this crate moves orders between
//! the five pipeline actors and spreads work across fan-out workers.
//!
//! ```text
//! monitor --> extract --> transform --> assimilate --> load
//!    |                                      |
//!  fan-out (claims)                  graph / index stores
//! ```

pub mod adapter;
pub mod api;
pub mod config;
pub mod fanout;
pub mod pipeline;
pub mod queue;
