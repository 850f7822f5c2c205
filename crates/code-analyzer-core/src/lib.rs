//! # Code Analyzer Core
//!
//! Runtime-agnostic building blocks for Code Analyzer: repository and
//! collection models, the adapter traits the pipeline orchestrator drives,
//! snapshot file filtering, vector helpers, and in-memory adapter
//! implementations.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Concrete
//! adapters (git, S3, OpenAI, SQLite) live in the `code-analyzer` app crate.

pub mod adapters;
pub mod embedding;
pub mod filter;
pub mod models;
pub mod store;
