//! Single-lane request queue.
//!
//! Every outbound Spotify call goes through one [`RequestQueue`]. Operations
//! are executed strictly one at a time, in submission order; each waits for
//! the previous operation's full completion (success or failure) before
//! starting. This keeps the process under the external rate limit without a
//! token-bucket scheme, and it makes the token check-then-use sequence inside
//! an operation race-free.
//!
//! An operation may perform several underlying requests (pagination, chunked
//! playlist writes) while it holds the lane. Re-submitting to the queue from
//! inside a running operation would wait on itself forever, so sub-requests
//! must be issued directly.

use std::future::Future;
use std::pin::Pin;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// FIFO executor for asynchronous API operations.
///
/// Cloneable handle; all clones feed the same worker, so the serialization
/// is process-wide as long as a single queue is shared.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl RequestQueue {
    /// Create the queue and spawn its worker task. The worker runs until
    /// every handle is dropped.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // Await to completion before dequeuing the next one.
                job.await;
            }
        });

        Self { tx }
    }

    /// Run an operation in the lane and return its output.
    ///
    /// The future is enqueued immediately; execution starts once every
    /// previously submitted operation has finished.
    pub async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();

        let job: Job = Box::pin(async move {
            let output = op.await;
            // Receiver may have been dropped; the operation still ran.
            let _ = done_tx.send(output);
        });

        self.tx
            .send(job)
            .map_err(|_| anyhow!("request queue worker is gone"))?;

        done_rx
            .await
            .map_err(|_| anyhow!("request queue dropped the operation"))
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_returns_operation_output() {
        let queue = RequestQueue::new();
        let out = queue.run(async { 41 + 1 }).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_operations_run_serially_in_submission_order() {
        let queue = RequestQueue::new();
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let events = events.clone();
            handles.push(queue.run(async move {
                events.lock().unwrap().push(format!("start{i}"));
                // Yield a few times so an overlapping operation would get a
                // chance to interleave if serialization were broken.
                tokio::time::sleep(Duration::from_millis(5)).await;
                events.lock().unwrap().push(format!("end{i}"));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let log = events.lock().unwrap().clone();
        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start{i}"), format!("end{i}")])
            .collect();
        assert_eq!(log, expected);
    }

    #[tokio::test]
    async fn test_failed_operation_does_not_block_the_lane() {
        let queue = RequestQueue::new();

        let first: Result<(), String> = queue
            .run(async { Err("boom".to_string()) })
            .await
            .unwrap();
        assert!(first.is_err());

        let second = queue.run(async { "still alive" }).await.unwrap();
        assert_eq!(second, "still alive");
    }

    #[tokio::test]
    async fn test_concurrent_submitters_never_overlap() {
        let queue = Arc::new(RequestQueue::new());
        let in_flight = Arc::new(Mutex::new(0usize));
        let max_in_flight = Arc::new(Mutex::new(0usize));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            joins.push(tokio::spawn(async move {
                queue
                    .run(async move {
                        {
                            let mut n = in_flight.lock().unwrap();
                            *n += 1;
                            let mut max = max_in_flight.lock().unwrap();
                            *max = (*max).max(*n);
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        *in_flight.lock().unwrap() -= 1;
                    })
                    .await
                    .unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        assert_eq!(*max_in_flight.lock().unwrap(), 1);
    }
}
