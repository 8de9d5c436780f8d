// dispatch.rs - Worker pool and shared futures
//
// Asset loads and hull cooks run on a small dispatch queue. The result of a
// dispatched job is an Async<T>: a sharable future that resolves exactly
// once, to Some(value) or None on failure. Workers never hold ECS locks.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

enum AsyncState<T> {
    Pending,
    Ready(Option<Arc<T>>),
}

struct AsyncInner<T> {
    state: Mutex<AsyncState<T>>,
    cv: Condvar,
}

/// A sharable, resolve-once future.
pub struct Async<T> {
    inner: Arc<AsyncInner<T>>,
}

impl<T> Clone for Async<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Async<T> {
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(AsyncInner {
                state: Mutex::new(AsyncState::Pending),
                cv: Condvar::new(),
            }),
        }
    }

    /// An already-resolved future.
    pub fn resolved(value: T) -> Self {
        Self {
            inner: Arc::new(AsyncInner {
                state: Mutex::new(AsyncState::Ready(Some(Arc::new(value)))),
                cv: Condvar::new(),
            }),
        }
    }

    /// An already-failed future.
    pub fn failed() -> Self {
        Self {
            inner: Arc::new(AsyncInner {
                state: Mutex::new(AsyncState::Ready(None)),
                cv: Condvar::new(),
            }),
        }
    }

    pub(crate) fn resolve(&self, value: Option<Arc<T>>) {
        let mut state = self.inner.state.lock();
        if matches!(*state, AsyncState::Ready(_)) {
            tracing::error!("Async resolved twice, ignoring second value");
            return;
        }
        *state = AsyncState::Ready(value);
        self.inner.cv.notify_all();
    }

    pub fn ready(&self) -> bool {
        matches!(*self.inner.state.lock(), AsyncState::Ready(_))
    }

    /// Non-blocking: None while pending or failed.
    pub fn get(&self) -> Option<Arc<T>> {
        match &*self.inner.state.lock() {
            AsyncState::Ready(value) => value.clone(),
            AsyncState::Pending => None,
        }
    }

    /// Block until resolution. None means the producer failed.
    pub fn wait(&self) -> Option<Arc<T>> {
        let mut state = self.inner.state.lock();
        loop {
            if let AsyncState::Ready(value) = &*state {
                return value.clone();
            }
            self.inner.cv.wait(&mut state);
        }
    }

    /// Block with a timeout; None if still pending when it expires.
    pub fn wait_for(&self, timeout: Duration) -> Option<Arc<T>> {
        let mut state = self.inner.state.lock();
        if let AsyncState::Ready(value) = &*state {
            return value.clone();
        }
        self.inner.cv.wait_for(&mut state, timeout);
        match &*state {
            AsyncState::Ready(value) => value.clone(),
            AsyncState::Pending => None,
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A named pool of worker threads consuming a job channel.
pub struct DispatchQueue {
    name: String,
    sender: Option<crossbeam_channel::Sender<Job>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl DispatchQueue {
    pub fn new(name: impl Into<String>, worker_count: usize) -> Self {
        let name = name.into();
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..worker_count.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                let thread_name = format!("{name}-{i}");
                std::thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn dispatch worker")
            })
            .collect();
        Self {
            name,
            sender: Some(sender),
            workers,
        }
    }

    /// Run `func` on a worker, returning its future. A job returning None
    /// resolves the future as failed.
    pub fn dispatch<T, F>(&self, func: F) -> Async<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Option<T> + Send + 'static,
    {
        let future = Async::pending();
        let result = future.clone();
        let job: Job = Box::new(move || {
            result.resolve(func().map(Arc::new));
        });
        match self.sender.as_ref() {
            Some(sender) if sender.send(job).is_ok() => {}
            _ => {
                tracing::error!(queue = %self.name, "dispatch queue is shut down");
                future.resolve(None);
            }
        }
        future
    }

    /// Close the channel and wait for in-flight jobs to finish.
    pub fn shutdown(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_resolves_futures() {
        let queue = DispatchQueue::new("test", 2);
        let ok = queue.dispatch(|| Some(41 + 1));
        let failed = queue.dispatch(|| None::<i32>);

        assert_eq!(*ok.wait().unwrap(), 42);
        assert!(failed.wait().is_none());
        assert!(ok.ready());
        assert_eq!(*ok.get().unwrap(), 42);
    }

    #[test]
    fn shared_futures_see_one_resolution() {
        let future = Async::<u32>::pending();
        let clone = future.clone();
        assert!(!clone.ready());
        assert!(clone.get().is_none());

        future.resolve(Some(Arc::new(7)));
        assert_eq!(*clone.wait().unwrap(), 7);
        assert_eq!(*clone.wait_for(Duration::from_millis(1)).unwrap(), 7);
    }
}
