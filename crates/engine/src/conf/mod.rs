//! Configuration module — engine config model, loading, and overrides.

pub mod load;
pub mod model;

pub use load::load;
pub use model::{ConfigOverrides, EngineConfig, LockBackend, StateBackend};
