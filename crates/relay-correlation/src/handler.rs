//! Handler abstraction for registrations.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

/// Invoked with `(id, body)` of a matched envelope.
///
/// The returned future is spawned detached; the dispatch loop never awaits
/// it, so a slow handler cannot stall intake.
pub trait SinkHandler: Send + Sync + 'static {
    fn call(&self, id: String, body: serde_json::Value) -> BoxFuture<'static, ()>;
}

impl<F, Fut> SinkHandler for F
where
    F: Fn(String, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, id: String, body: serde_json::Value) -> BoxFuture<'static, ()> {
        self(id, body).boxed()
    }
}
