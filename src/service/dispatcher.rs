use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::docker::{DockerError, EventStream};

use super::lifecycle::ContainerSync;

/// Fans lifecycle events out to a fixed pool of workers.
///
/// Events for different containers may be handled out of order. A stale
/// registration left behind by a reordered stop is removed by the
/// container's heartbeat, which re-checks the run state on every beat.
pub struct EventDispatcher {
    sync: Arc<ContainerSync>,
    workers: usize,
    queue_size: usize,
}

impl EventDispatcher {
    pub fn new(sync: Arc<ContainerSync>, workers: usize, queue_size: usize) -> Self {
        Self {
            sync,
            workers: workers.max(1),
            queue_size: queue_size.max(1),
        }
    }

    /// Feeds `events` to the workers until the stream ends or `shutdown` is
    /// cancelled, then waits for the workers to drain the queue.
    ///
    /// A transport error from the stream is returned once the queue drained.
    pub async fn run(
        &self,
        mut events: EventStream,
        shutdown: CancellationToken,
    ) -> Result<(), DockerError> {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let rx = Arc::new(Mutex::new(rx));

        let mut join_set = JoinSet::new();
        for worker in 0..self.workers {
            let rx = Arc::clone(&rx);
            let sync = Arc::clone(&self.sync);
            join_set.spawn(async move {
                loop {
                    let event = rx.lock().await.recv().await;
                    let Some(event) = event else {
                        break;
                    };
                    sync.handle_event(&event).await;
                }
                log::debug!("Event worker {worker} finished");
            });
        }

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    // Blocks while the queue is full
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break Ok(()),
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                break Ok(());
                            }
                        }
                    }
                }
                Some(Err(DockerError::Protocol(reason))) => {
                    log::warn!("Skipping malformed event: {reason}");
                }
                Some(Err(e)) => break Err(e),
                None => {
                    log::info!("Event stream ended");
                    break Ok(());
                }
            }
        };

        // Closing the queue lets the workers finish what is already queued
        drop(tx);
        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                log::error!("Event worker failed: {e}");
            }
        }

        result
    }
}
