//! Single-threaded FIFO job queue used by the metadata and data paths.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Waiting,
    Terminated,
}

struct Inner {
    jobs: VecDeque<Job>,
    state: State,
}

struct Shared {
    inner: Mutex<Inner>,
    cv: Condvar,
}

/// A worker thread draining an ordered queue of jobs.
///
/// Jobs run outside the queue lock and must not rely on any ordering beyond
/// FIFO. While the worker is waiting, submissions are still queued and run
/// once [`BackgroundWorker::run`] is called. Dropping the worker terminates
/// the thread and then finishes any queued jobs inline, so no submitted job
/// is lost.
pub struct BackgroundWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn new(run_at_beginning: bool) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                jobs: VecDeque::new(),
                state: if run_at_beginning {
                    State::Running
                } else {
                    State::Waiting
                },
            }),
            cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || process_jobs(&worker_shared));

        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn submit_job<F: FnOnce() + Send + 'static>(&self, job: F) {
        let mut inner = match self.shared.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.state == State::Terminated {
            return;
        }
        inner.jobs.push_back(Box::new(job));
        self.shared.cv.notify_one();
    }

    /// Resume job processing.
    pub fn run(&self) {
        self.set_state(State::Running);
    }

    /// Pause job processing; submissions keep queueing.
    pub fn wait(&self) {
        self.set_state(State::Waiting);
    }

    fn set_state(&self, state: State) {
        let mut inner = match self.shared.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.state != State::Terminated {
            inner.state = state;
        }
        self.shared.cv.notify_all();
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        {
            let mut inner = match self.shared.inner.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.state = State::Terminated;
            self.shared.cv.notify_all();
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        // Best-effort completion of whatever is still queued.
        let drained: Vec<Job> = {
            let mut inner = match self.shared.inner.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.jobs.drain(..).collect()
        };
        for job in drained {
            job();
        }
    }
}

fn process_jobs(shared: &Shared) {
    loop {
        let job = {
            let guard = match shared.inner.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut guard = match shared
                .cv
                .wait_while(guard, |inner| {
                    inner.state == State::Waiting
                        || (inner.state == State::Running && inner.jobs.is_empty())
                }) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.state == State::Terminated {
                return;
            }
            match guard.jobs.pop_front() {
                Some(job) => job,
                None => continue,
            }
        };
        // Run outside the lock so jobs can submit further jobs.
        job();
    }
}
