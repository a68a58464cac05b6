//! Single-flight: one spawned computation, any number of joiners.

use std::future::Future;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::error::Result;

/// A joinable handle on a computation running on its own task.
pub type Flight<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Spawn `fut` and return a handle every caller can await for the same result.
///
/// The task runs to completion even if every joiner is dropped.
pub fn spawn_flight<T, F>(fut: F) -> Flight<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    async move { handle.await? }.boxed().shared()
}

/// True once the computation has finished and at least one joiner observed it.
pub fn is_settled<T: Clone>(flight: &Flight<T>) -> bool {
    flight.peek().is_some()
}
