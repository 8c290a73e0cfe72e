//! Runtime abstraction for spawning background futures.

use std::future::Future;

/// Abstraction for spawning task execution on a runtime.
pub trait Spawn: Clone + Send + Sync + 'static {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
