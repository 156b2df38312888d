//! auth-queue - Per-principal serialization for authentication operations
//!
//! This crate provides an in-process queue service for auth-related work:
//! - Bounded per-principal queues with overflow eviction
//! - Priority dispatch across principals, FIFO within a priority tier
//! - A fixed worker pool with per-operation execution timeouts
//! - Exponential-backoff retry for transient backend failures
//! - Active expiration of stale operations via a background janitor
//! - Read-only queue diagnostics

pub mod backend;
pub mod config;
pub mod device;
mod dispatch;
mod janitor;
pub mod operation;
pub mod queue;
pub mod service;
pub mod stats;
#[cfg(test)]
pub mod testutil;

pub use service::{AuthQueueService, CompletionHook, EnqueueOptions, QueueError};
