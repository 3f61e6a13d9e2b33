//! The trading engine: price state, strategies, order lifecycle,
//! schedulers and supervision.

pub mod dispatcher;
pub mod lifecycle;
pub mod messages;
pub mod positions;
pub mod price;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod strategy;
pub mod supervisor;

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Run a task under the bounded worker pool. The semaphore queues
/// excess work, so tick storms cannot fan out unbounded concurrent
/// buys/sells.
pub fn spawn_pooled<F>(pool: Arc<Semaphore>, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let _permit = match pool.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        fut.await;
    });
}
