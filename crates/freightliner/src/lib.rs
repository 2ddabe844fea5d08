//! # Freightliner
//!
//! A tree-replication engine for container registries.
//!
//! Freightliner copies a filtered set of repositories — manifests, manifest
//! indices, and the blobs they reference — from a source registry to a
//! destination registry, with resumable checkpointing and per-tag failure
//! isolation. It makes replicating a whole registry tree safe to start and
//! safe to re-run.
//!
//! ## Features
//!
//! - **Tree replication** — Walk every repository under a source prefix,
//!   substitute it onto a destination prefix, and copy each surviving tag.
//! - **Repository and tag filtering** — Exclude repositories, exclude tags,
//!   or restrict to an include-list, evaluated once per tree and cached.
//! - **Resumable execution** — Interrupted trees persist a checkpoint after
//!   every repository; `resume-from` replays it and skips completed work.
//! - **Parallel, thread-based workers** — A bounded job queue hands
//!   repositories to a fixed pool of `std::thread` workers; no async
//!   runtime in the engine.
//! - **Digest-aware copying** — Manifest indices copy their children before
//!   the parent manifest; blobs already present at the destination are
//!   skipped without a fetch.
//! - **Configurable retry** — Transient transport errors are retried at the
//!   registry-client layer with exponential or fixed backoff and jitter.
//!
//! ## Pipeline
//!
//! The core flow is **config → orchestrate → checkpoint**:
//!
//! 1. [`config::FreightlinerConfig`] loads `.freightliner.toml`, merges CLI
//!    overrides, and builds a [`types::TreeJobSpec`].
//! 2. [`orchestrator::run_tree`] lists source repositories, filters and
//!    renames them, and dispatches them across worker threads.
//! 3. [`worker::replicate_repository`] lists a repository's tags, filters
//!    them, and drives [`copier::Copier`] over each surviving tag.
//! 4. [`checkpoint::CheckpointStore`] persists a [`types::TreeRecord`] after
//!    every repository so an interrupted tree can be resumed.
//!
//! ## Modules
//!
//! - [`types`] — Domain types: registries, jobs, checkpoints, outcomes
//! - [`config`] — Configuration file (`.freightliner.toml`) loading and merging
//! - [`filter`] and [`pattern_cache`] — Repository and tag filtering
//! - [`stream`] — Digest-verifying and cancelable `Read` wrappers for streamed blobs
//! - [`registry`] — `RegistryClient` trait and the HTTP registry backend
//! - [`credentials`] — Auth-mode resolution for registry connections
//! - [`retry`] — Configurable retry strategies with backoff and jitter
//! - [`copier`] — Single-tag manifest and blob copy logic
//! - [`worker`] — Per-repository replication algorithm
//! - [`orchestrator`] — Tree-wide job dispatch across worker threads
//! - [`checkpoint`] — `CheckpointStore` trait and file-backed persistence
//! - [`reporter`] — Progress/log sink decoupled from presentation
//! - [`error`] — Error classification shared across the engine
//! - [`process`] — Cross-platform command execution with timeout support
//!
//! ## Stability
//!
//! The library API is subject to change before v1.0.0.
//!
//! ## CLI Usage
//!
//! For command-line usage, see the `freightliner-cli` crate.

/// Domain types: registries, jobs, checkpoints, outcomes.
pub mod types;

/// Configuration file (`.freightliner.toml`) loading and merging.
pub mod config;

/// Compiled glob/pattern cache shared by the filter engine.
pub mod pattern_cache;

/// Repository and tag filtering.
pub mod filter;

/// Configurable retry strategies with backoff and jitter.
pub mod retry;

/// Cross-platform command execution with timeout support.
pub mod process;

/// Auth-mode resolution for registry connections.
pub mod credentials;

/// Streaming blob I/O: digest verification and cooperative cancellation.
pub mod stream;

/// `RegistryClient` trait and the HTTP registry backend.
pub mod registry;

/// Error classification shared across the engine.
pub mod error;

/// `CheckpointStore` trait and file-backed persistence.
pub mod checkpoint;

/// Progress/log sink decoupled from presentation.
pub mod reporter;

/// Single-tag manifest and blob copy logic.
pub mod copier;

/// Per-repository replication algorithm.
pub mod worker;

/// Tree-wide job dispatch across worker threads.
pub mod orchestrator;

/// In-memory `RegistryClient` double shared by copier/worker/orchestrator tests.
#[cfg(test)]
mod test_support;
