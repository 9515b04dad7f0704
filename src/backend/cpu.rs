//! Ordered task chain over the rayon worker pool.
//!
//! Every submission on a thread state depends on that thread's previous
//! task, so work observes program order per thread while independent
//! threads (and the units inside one submission) run in parallel.
//! Completion is propagated through continuations rather than by blocking a
//! worker, so an arbitrarily long chain cannot starve the pool.

use std::sync::{Arc, Condvar, Mutex};

use rayon::prelude::*;

type Continuation = Box<dyn FnOnce() + Send>;

struct TaskState {
    done: bool,
    continuations: Vec<Continuation>,
}

struct TaskInner {
    state: Mutex<TaskState>,
    cv: Condvar,
}

/// Handle to one enqueued unit of work. Cheap to clone; cloning does not
/// duplicate the work.
#[derive(Clone)]
pub struct Task(Arc<TaskInner>);

impl Task {
    fn new() -> Task {
        Task(Arc::new(TaskInner {
            state: Mutex::new(TaskState {
                done: false,
                continuations: Vec::new(),
            }),
            cv: Condvar::new(),
        }))
    }

    fn complete(&self) {
        let pending = {
            let mut state = self.0.state.lock().unwrap();
            state.done = true;
            self.0.cv.notify_all();
            std::mem::take(&mut state.continuations)
        };
        for c in pending {
            c();
        }
    }

    fn on_complete(&self, c: Continuation) {
        let mut state = self.0.state.lock().unwrap();
        if state.done {
            drop(state);
            c();
        } else {
            state.continuations.push(c);
        }
    }

    /// Block the calling thread until the task has finished. Must only be
    /// called from outside the worker pool, with the global lock released.
    pub fn wait(&self) {
        let mut state = self.0.state.lock().unwrap();
        while !state.done {
            state = self.0.cv.wait(state).unwrap();
        }
    }

    pub fn is_done(&self) -> bool {
        self.0.state.lock().unwrap().done
    }
}

/// Number of workers backing the pool.
pub fn pool_size() -> u32 {
    rayon::current_num_threads() as u32
}

/// Enqueue `units` parallel invocations of `f`, ordered after `prev`.
pub fn submit(prev: Option<&Task>, units: u32, f: impl Fn(u32) + Send + Sync + 'static) -> Task {
    let task = Task::new();
    let work = {
        let task = task.clone();
        move || {
            rayon::spawn(move || {
                if units <= 1 {
                    f(0);
                } else {
                    (0..units).into_par_iter().for_each(|i| f(i));
                }
                task.complete();
            });
        }
    };
    match prev {
        Some(p) => p.on_complete(Box::new(work)),
        None => work(),
    }
    task
}

/// A task that completes once every dependency has.
pub fn barrier(deps: &[Task]) -> Task {
    let task = Task::new();
    if deps.is_empty() {
        task.complete();
        return task;
    }
    let outstanding = Arc::new(std::sync::atomic::AtomicU32::new(deps.len() as u32));
    for dep in deps {
        let outstanding = outstanding.clone();
        let task = task.clone();
        dep.on_complete(Box::new(move || {
            if outstanding.fetch_sub(1, std::sync::atomic::Ordering::AcqRel) == 1 {
                task.complete();
            }
        }));
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn chain_preserves_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut prev: Option<Task> = None;
        for i in 0..16 {
            let log = log.clone();
            let task = submit(prev.as_ref(), 1, move |_| log.lock().unwrap().push(i));
            prev = Some(task);
        }
        prev.unwrap().wait();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn units_all_run() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let task = submit(None, 1000, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        task.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn barrier_waits_for_all() {
        let counter = Arc::new(AtomicU32::new(0));
        let tasks: Vec<Task> = (0..4)
            .map(|_| {
                let c = counter.clone();
                submit(None, 8, move |_| {
                    c.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        barrier(&tasks).wait();
        assert_eq!(counter.load(Ordering::Relaxed), 32);
    }
}
