// Batch Handler Port

use async_trait::async_trait;

/// User-supplied batch consumer.
///
/// Returns the items it did NOT process; they are requeued. Everything not
/// returned counts as done, even if the handler logged a business failure.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, items: Vec<T>) -> Vec<T>;
}

/// Plain closures are handlers
#[async_trait]
impl<T, F> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Vec<T> + Send + Sync,
{
    async fn handle(&self, items: Vec<T>) -> Vec<T> {
        self(items)
    }
}
