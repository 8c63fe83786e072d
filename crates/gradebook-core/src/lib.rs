//! gradebook-core: grade and competency aggregation engine.
//!
//! Turns raw assessment scores, competency evidence and attendance marks
//! into per-student summaries. The pure aggregation pipeline (normalizer,
//! weighting resolver, competency roller, summary builder) is separate from
//! the recomputation machinery (scheduler and engine) that keeps summaries
//! consistent with the raw rows behind the `RecordSource` and `SummarySink`
//! traits.

pub mod builder;
pub mod competency;
pub mod engine;
pub mod error;
pub mod model;
pub mod normalizer;
pub mod policy;
pub mod records;
pub mod scale;
pub mod scheduler;
pub mod summary;
pub mod traits;
pub mod weighting;
