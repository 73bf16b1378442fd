//! Background cleanup: prune partial pushes nobody finished.

use deltasync_core::Server;
use std::time::Duration;
use tokio::time;

pub fn spawn_cleanup_task(server: Server, every: Duration, max_age: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            let pruned = server.prune_accumulators(max_age).await;
            tracing::debug!("Cleanup completed, {} partial pushes dropped", pruned);
        }
    });
}
