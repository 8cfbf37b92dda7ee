//! Strict-order queue: staged in-process pipelines whose completions retire
//! in push order.
//!
//! A [`Soque`] coordinates three phases over a fixed ring of slot markers:
//! ingress (`push`), parallel processing (`proc_get`/`proc_done`) and egress
//! (`pop`). Any number of worker threads may process claims out of order,
//! but items become visible to the consumer strictly in the order they were
//! pushed. The ring carries no payload; user data lives in user storage,
//! addressed by the slot indices the queue hands out.
//!
//! [`SoqueThreads`] multiplexes several queues over a pool of worker threads
//! (optionally pinned to cores) and drives the user's [`SoqueHandler`]
//! callbacks, scaling the number of active helpers with measured throughput.

pub mod ffi;
pub mod soque;
pub mod threads;

pub use soque::Soque;
pub use threads::{SoqueThreads, DEFAULT_BATCH, DEFAULT_REACTION_MS, DEFAULT_THRESHOLD};

use std::sync::OnceLock;
use std::thread;

// User side of a pipeline. One handler serves one queue; the queue stores it
// at open and passes nothing else back.
pub trait SoqueHandler: Send + Sync + 'static {
    /// Produce up to `available` items into user storage and return how many
    /// were produced. Called only by the worker currently holding the
    /// queue's push/pop gate. When `waitable` is true no helper is
    /// productive and the callback may block; otherwise it must return
    /// promptly.
    fn push(&self, available: usize, waitable: bool) -> usize;

    /// Process the slots `[index, index + count)`, wrapping at the ring
    /// size. Called from any worker, on ranges that never overlap a
    /// concurrent claim. Must not touch slots outside the range.
    fn proc(&self, index: usize, count: usize);

    /// Retire up to `ready` items from the front of the pipeline and return
    /// how many were consumed. Same gate and `waitable` contract as
    /// [`SoqueHandler::push`].
    fn pop(&self, ready: usize, waitable: bool) -> usize;
}

/// Hardware concurrency, captured once per process.
pub fn max_threads() -> usize {
    static MAX_THREADS: OnceLock<usize> = OnceLock::new();
    *MAX_THREADS
        .get_or_init(|| thread::available_parallelism().map(usize::from).unwrap_or(1))
}
