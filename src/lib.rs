//! # Extraction Scheduler
//!
//! Concurrency-control primitives for data-extraction runtimes that pull
//! large volumes of records from rate-limited remote services.
//!
//! Four components cooperate to keep external load bounded and fair while
//! still making progress on recursive, paginated work:
//!
//! - **[`ResourceGuard`](core::ResourceGuard)**: a resizable counting budget
//!   with partial grants and strictly FIFO waiters.
//! - **[`ThrottledRunner`](core::ThrottledRunner)**: runs independent
//!   operations under a parallelism cap and a rolling rate window, with
//!   stop-on-first-error or continue-on-error semantics.
//! - **[`RecursiveScheduler`](core::RecursiveScheduler)**: drives a work queue
//!   to exhaustion where processing one chunk may yield follow-up items
//!   (next-page cursors, child nodes).
//! - **[`TaskManager`](core::TaskManager)**: a registry of named one-shot and
//!   periodic background tasks sharing one cancellation scope.
//!
//! Cancellation is cooperative and explicit: every component observes a
//! [`tokio_util::sync::CancellationToken`] at its suspension points, stops
//! admitting new work, lets in-flight work finish and then unwinds.
//!
//! ## Example
//!
//! ```rust,ignore
//! use extraction_scheduler::config::RunnerConfig;
//! use extraction_scheduler::core::{ResourceGuard, RecursiveScheduler, ThrottledRunner};
//! use tokio_util::sync::CancellationToken;
//!
//! let scope = CancellationToken::new();
//! let runner = ThrottledRunner::with_cancellation(
//!     RunnerConfig::new()
//!         .with_max_parallelism(4)
//!         .with_rate_limit(100, std::time::Duration::from_secs(60)),
//!     &scope,
//! );
//! let budget = ResourceGuard::new(16);
//! let mut scheduler =
//!     RecursiveScheduler::new(my_handler, seeds, runner, 8, Some(budget), &scope)?;
//! let progress = scheduler.run().await?;
//! assert_eq!(progress.finished + progress.aborted, progress.total);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Concurrency-control primitives and their error and event types.
pub mod core;
/// Configuration models for runners, schedulers and periodic tasks.
pub mod config;
/// Builders to construct components from configuration.
pub mod builders;
/// Runtime adapters and orchestration surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
