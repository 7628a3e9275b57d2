//! Umbrella crate for turtledash.
//!
//! This crate is intentionally small: it re-exports the engine and protocol crates
//! so downstream code can depend on a single crate name (`turtledash`).

pub use turtledash_engine as engine;
pub use turtledash_protocol as protocol;
