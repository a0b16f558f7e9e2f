//! Logical threads: ordered work queues keyed by thread id.
//!
//! Each logical thread is a tokio task draining an unbounded FIFO. Jobs on
//! one thread run one at a time in arrival order; different threads run
//! independently.

use std::sync::Mutex;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A unit of work queued on a logical thread.
pub type Job = BoxFuture<'static, ()>;

enum ThreadMsg {
    Run(Job),
    Stop,
}

struct ThreadHandle {
    tx: mpsc::UnboundedSender<ThreadMsg>,
    join: JoinHandle<()>,
}

/// The logical threads of one server connection.
#[derive(Default)]
pub struct LogicalThreads {
    threads: DashMap<u64, ThreadHandle>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl LogicalThreads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `job` on thread `id`, starting the thread if needed.
    pub fn submit(&self, id: u64, job: Job) {
        let entry = self.threads.entry(id).or_insert_with(|| spawn_thread(id));
        if entry.tx.send(ThreadMsg::Run(job)).is_err() {
            tracing::warn!(thread = id, "Logical thread is gone, dropping job");
        }
    }

    /// Stops accepting work on `id`. Queued jobs still run. Returns false
    /// if no such thread exists.
    pub fn stop(&self, id: u64) -> bool {
        match self.threads.remove(&id) {
            Some((_, handle)) => {
                let _ = handle.tx.send(ThreadMsg::Stop);
                self.retire(handle.join);
                true
            }
            None => false,
        }
    }

    /// Pushes the stop sentinel into every thread.
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.threads.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.stop(id);
        }
    }

    /// Waits for every stopped thread to drain.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.retired.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Logical thread ended abnormally");
            }
        }
    }

    /// Number of running logical threads.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn retire(&self, join: JoinHandle<()>) {
        let mut retired = self.retired.lock().unwrap_or_else(|p| p.into_inner());
        retired.retain(|handle| !handle.is_finished());
        retired.push(join);
    }
}

fn spawn_thread(id: u64) -> ThreadHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(async move {
        tracing::debug!(thread = id, "Logical thread started");
        while let Some(msg) = rx.recv().await {
            match msg {
                ThreadMsg::Run(job) => job.await,
                ThreadMsg::Stop => break,
            }
        }
        tracing::debug!(thread = id, "Logical thread exited");
    });
    ThreadHandle { tx, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32, u64) -> Job) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |n: u32, delay_ms: u64| -> Job {
                let log = Arc::clone(&log);
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    log.lock().unwrap().push(n);
                })
            }
        };
        (log, make)
    }

    #[tokio::test]
    async fn test_jobs_on_one_thread_run_in_order() {
        let threads = LogicalThreads::new();
        let (log, job) = recorder();
        threads.submit(1, job(1, 30));
        threads.submit(1, job(2, 0));
        threads.submit(1, job(3, 10));
        assert_eq!(threads.len(), 1);

        threads.close_all();
        threads.join().await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(threads.is_empty());
    }

    #[tokio::test]
    async fn test_threads_run_independently() {
        let threads = LogicalThreads::new();
        let (log, job) = recorder();
        threads.submit(1, job(1, 100));
        threads.submit(2, job(2, 0));
        assert_eq!(threads.len(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec![2]);

        threads.close_all();
        threads.join().await;
        assert_eq!(*log.lock().unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_stop_drains_then_frees_the_id() {
        let threads = LogicalThreads::new();
        let (log, job) = recorder();
        threads.submit(7, job(1, 20));
        assert!(threads.stop(7));
        assert!(!threads.stop(7));
        assert!(threads.is_empty());

        threads.submit(7, job(2, 0));
        assert_eq!(threads.len(), 1);

        threads.close_all();
        threads.join().await;
        let mut seen = log.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }
}
