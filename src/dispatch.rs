//! Cross-thread invocation onto the simulation thread.
//!
//! Mutators on the avatar may be called from script or network threads.
//! Instead of erroring, the call is queued and executed by the owner thread
//! on its next frame; calls already on the owner thread run inline.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    owner: ThreadId,
    pending: Mutex<Vec<Task>>,
}

/// Handle to the simulation thread's task queue. Cheap to clone and share.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// The creating thread becomes the owner.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                owner: thread::current().id(),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    /// Run `f` inline when called on the owner thread, otherwise queue it
    /// for the next `run_pending`. Calling from the wrong thread is the
    /// normal path, not an error.
    pub fn invoke<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_owner_thread() {
            f();
        } else {
            self.inner.pending.lock().unwrap().push(Box::new(f));
        }
    }

    /// Always queue, even on the owner thread. Used for "next tick" work
    /// that must not run inside the current frame.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.pending.lock().unwrap().push(Box::new(f));
    }

    /// Like `invoke`, but waits for the result. The owner thread must keep
    /// calling `run_pending` for this to complete.
    pub fn blocking_invoke<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_owner_thread() {
            return f();
        }
        let (tx, rx) = mpsc::channel();
        self.invoke(move || {
            let _ = tx.send(f());
        });
        rx.recv().expect("task queue dropped while waiting for result")
    }

    /// Execute everything queued so far. Called once per frame by the owner.
    pub fn run_pending(&self) {
        let tasks: Vec<Task> = std::mem::take(&mut *self.inner.pending.lock().unwrap());
        for task in tasks {
            task();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_owner_thread_runs_inline() {
        let queue = TaskQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        queue.invoke(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_other_thread_queues() {
        let queue = TaskQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let q = queue.clone();
        let c = counter.clone();
        thread::spawn(move || {
            q.invoke(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        })
        .join()
        .unwrap();
        // nothing ran yet
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_len(), 1);
        queue.run_pending();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_defer_skips_inline_execution() {
        let queue = TaskQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        queue.defer(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        queue.run_pending();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_invoke_from_other_thread() {
        let queue = TaskQueue::new();
        let q = queue.clone();
        let handle = thread::spawn(move || q.blocking_invoke(|| 21 * 2));
        // pump until the task arrives and runs
        while queue.pending_len() == 0 {
            thread::yield_now();
        }
        queue.run_pending();
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn test_blocking_invoke_inline_on_owner() {
        let queue = TaskQueue::new();
        assert_eq!(queue.blocking_invoke(|| "ok"), "ok");
    }
}
