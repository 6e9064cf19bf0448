//! BarVault Runner: fetch orchestration on top of `barvault-core`.
//!
//! This crate provides:
//! - TOML fetch settings (HTTP, retry, rate limit, concurrency, endpoints)
//! - The per-key pipeline (resume, plan, fetch, commit partial progress)
//! - Concurrent batches over many keys with a shared rate limiter
//! - Store inspection and integrity verification
//! - Update planning: bring every stored series up to a target end

pub mod batch;
pub mod inspect;
pub mod pipeline;
pub mod settings;
pub mod update;

pub use batch::{run_batch, BatchSummary};
pub use inspect::{verify_store, SeriesFilter, VerifyEntry};
pub use pipeline::{run_key, KeyJob, KeyReport, KeyStatus, PipelineContext, PipelineError};
pub use settings::{ConfigError, FetchSettings};
pub use update::{plan_updates, UpdateGroup};
