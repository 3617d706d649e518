use std::future::Future;
use std::time::Duration;

/// Spawns a future that runs to completion without being awaited.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future);
}

pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
