//! gradebook-runtime: storage, configuration and process setup around
//! `gradebook-core`.
//!
//! Provides an in-memory record and summary store that implements the core
//! storage traits and notifies the scheduler on every raw-row mutation,
//! JSON dataset fixtures, TOML configuration with env overrides, a
//! fault-injecting store wrapper and tracing initialisation.

pub mod config;
pub mod dataset;
pub mod error;
pub mod memory;
pub mod mock;
pub mod telemetry;

pub use config::{load_config, load_config_from, EngineSection, GradebookConfig};
pub use dataset::Dataset;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use mock::FlakyStore;
pub use telemetry::init_tracing;
