//! Managed thread queue: a small bounded worker pool for handler work that
//! shouldn't run inline on the delivering task (blocking I/O, CPU-bound
//! transforms), plus ordered per-session queues layered on the same pool.
//!
//! Plain `submit` jobs run in whatever order workers happen to pick them up.
//! `submit_ordered` jobs for the same session key never run concurrently
//! with each other and always run in submission order, even though jobs for
//! different session keys still execute in parallel across the pool --
//! exactly the per-session FIFO guarantee interactive sessions need without
//! giving every session its own dedicated worker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Task {
    Plain(Job),
    Session { key: String, job: Job },
}

struct SessionState {
    queue: VecDeque<Job>,
    busy: bool,
}

struct Inner {
    sender: mpsc::Sender<Task>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl Inner {
    /// Called after a session job finishes: hand the next queued job for
    /// that session back to the pool, or mark the session idle if its
    /// queue is empty.
    async fn advance_session(&self, key: String) {
        let next = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&key) {
                Some(state) => match state.queue.pop_front() {
                    Some(job) => Some(job),
                    None => {
                        state.busy = false;
                        None
                    }
                },
                None => None,
            }
        };
        if let Some(job) = next {
            let _ = self.sender.send(Task::Session { key, job }).await;
        }
    }
}

/// A fixed-size pool of worker tasks pulling jobs off a shared channel.
/// Backpressure comes from the channel's bounded capacity, not from
/// tracking busy workers directly: `submit`/`submit_ordered` block once
/// `capacity` jobs are already queued, regardless of how many workers are
/// mid-job.
pub struct ManagedThreadQueue {
    inner: Arc<Inner>,
    worker_count: usize,
    _workers: JoinSet<()>,
}

impl ManagedThreadQueue {
    /// Spawn `workers` tasks, each draining the shared job channel.
    /// `capacity` bounds how many jobs can be queued before `submit` blocks.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let inner = Arc::new(Inner {
            sender: tx,
            sessions: Mutex::new(HashMap::new()),
        });
        let mut set = JoinSet::new();

        for _ in 0..workers {
            let rx = rx.clone();
            let inner = inner.clone();
            set.spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match task {
                        Some(Task::Plain(job)) => job(),
                        Some(Task::Session { key, job }) => {
                            job();
                            inner.advance_session(key).await;
                        }
                        None => break,
                    }
                }
            });
        }

        ManagedThreadQueue {
            inner,
            worker_count: workers,
            _workers: set,
        }
    }

    /// Queue `job` for execution on a worker with no ordering guarantee
    /// relative to any other job. Awaits if the channel is full.
    pub async fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.inner.sender.send(Task::Plain(Box::new(job))).await;
    }

    /// Queue `job` under `session_key`. Jobs sharing a key always run one at
    /// a time, in submission order; jobs under different keys run freely
    /// across the pool.
    pub async fn submit_ordered<F>(&self, session_key: impl Into<String>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let key = session_key.into();
        let job: Job = Box::new(job);

        let dispatch_now = {
            let mut sessions = self.inner.sessions.lock().await;
            let state = sessions.entry(key.clone()).or_insert_with(|| SessionState {
                queue: VecDeque::new(),
                busy: false,
            });
            if state.busy {
                state.queue.push_back(job);
                None
            } else {
                state.busy = true;
                Some(job)
            }
        };

        if let Some(job) = dispatch_now {
            let _ = self.inner.sender.send(Task::Session { key, job }).await;
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn jobs_run_on_workers() {
        let mtq = ManagedThreadQueue::new(2, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            mtq.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn ordered_jobs_for_one_session_run_in_submission_order() {
        let mtq = ManagedThreadQueue::new(4, 32);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..20 {
            let order = order.clone();
            mtq.submit_ordered("session-a", move || {
                order.lock().unwrap().push(i);
            })
            .await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn different_sessions_do_not_serialize_against_each_other() {
        let mtq = ManagedThreadQueue::new(4, 32);
        let counter = Arc::new(AtomicUsize::new(0));

        for session in ["a", "b", "c", "d"] {
            for _ in 0..5 {
                let counter = counter.clone();
                mtq.submit_ordered(session, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
