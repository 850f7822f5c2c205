//! # Code Analyzer
//!
//! Answers natural-language questions about a Git repository.
//!
//! The first question about a repository ingests it: the repository is
//! snapshotted into a scratch blob collection, every surviving file is
//! embedded, and the vectors are stored in SQLite. Every question then
//! retrieves the nearest files and hands them to a chat model together with
//! the question.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │  Git / Blob  │──▶│  Ingestion     │──▶│  SQLite       │
//! │  snapshot    │   │ fan-out embed │   │ vectors+runs │
//! └──────────────┘   └───────────────┘   └──────┬───────┘
//!                                               │
//!                                               ▼
//!                    ┌───────────────┐   ┌──────────────┐
//!                    │  Chat model    │◀──│  Retrieval    │
//!                    └───────────────┘   └──────────────┘
//! ```
//!
//! Every run is recorded stage by stage in a durable ledger so an
//! interrupted run can be resumed without repeating committed work.
//!
//! ## Quick Start
//!
//! ```bash
//! analyzer init
//! analyzer analyze https://github.com/bitovi/temporal.git "How are workflows retried?"
//! analyzer ask https://github.com/bitovi/temporal.git "Where is the worker configured?"
//! analyzer runs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`analyze`] | Pipeline orchestrator and adapter wiring |
//! | [`ingest`] | Ingestion pipeline (snapshot, embed, persist, cleanup) |
//! | [`retrieve`] | Retrieval pipeline |
//! | [`prompt`] | Conversation composition |
//! | [`runs`] | Durable run ledger |
//! | [`retry`] | Cancellable retry with exponential backoff |
//! | [`fanout`] | Bounded fan-out / fan-in |
//! | [`error`] | Pipeline error taxonomy |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite vector store |
//! | [`embedding`] | OpenAI embeddings |
//! | [`completion`] | OpenAI chat completions |
//! | [`blob_s3`] | S3 blob store |
//! | [`blob_fs`] | Filesystem blob store |
//! | [`snapshot_git`] | Git snapshot source |
//! | [`chaos`] | Fault injection |
//! | [`chaos_server`] | Chaos toggle server and client |
//! | [`progress`] | Stage progress on stderr |

pub mod analyze;
pub mod blob_fs;
pub mod blob_s3;
pub mod chaos;
pub mod chaos_server;
pub mod completion;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod migrate;
pub mod progress;
pub mod prompt;
pub mod retrieve;
pub mod retry;
pub mod runs;
pub mod snapshot_git;
pub mod sqlite_store;
