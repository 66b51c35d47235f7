//! Umbrella crate for farmhand.
//!
//! Re-exports the runner, engine and protocol crates so downstream code can
//! depend on a single crate name (`farmhand`).

pub use farmhand_engine as engine;
pub use farmhand_protocol as protocol;
pub use farmhand_runner as runner;
