//! Evaluation harness for strengthened regression-test pipelines.
//!
//! This library provides:
//! - A concurrent-safe, file-locked result store shared by all pipeline
//!   stages (`store`)
//! - Pure unified-diff manipulation: block splitting, conflict removal,
//!   filtering, and test directive extraction (`patch`)
//! - Benchmark instance modelling and per-benchmark image/test-command
//!   conventions (`benchmark`)
//! - A Docker-backed container runner that applies patches and executes
//!   per-instance test scripts (`container`)
//! - Framework-aware test log parsers (`logparse`)
//! - A must-cover engine: tree-sitter analysis, def/use slicing, and
//!   coverage report ingestion for four toolchains (`coverage`)

pub mod benchmark;
pub mod container;
pub mod coverage;
pub mod logparse;
pub mod patch;
pub mod store;

// Re-export key store types
pub use store::{
    CoverageRate, EvaluationInfo, ResultStore, StageEntry, StoreError, StoreResult,
    StoreStatistics, FAIL_STATUS, SUCCESS_STATUS, UNKNOWN_STATUS,
};

// Re-export key benchmark types
pub use benchmark::{BenchmarkKind, Instance, Language};

// Re-export key container types
pub use container::{
    ContainerEngine, ContainerLimits, DockerCli, EvalRequest, EvalOutcome, RunnerError,
};

// Re-export key log parser types
pub use logparse::{analyze_status_map, parser_for, TestStatus, EMPTY_STATUS_MAP_FAILURE};

// Re-export key coverage types
pub use coverage::{CoverageError, CoverageOutcome, FileMustCover, MustCoverMap};
