//! Fixed-size worker pool that remembers unfinished work
//!
//! Workers drain an unbounded channel. Each worker publishes the item it is
//! processing in a slot, so when the pool is stopped early everything not
//! yet handled (queued, in flight or parked) can be collected and persisted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error};

enum Task<T> {
    Run(T),
    Stop,
}

struct Shared<T> {
    sender: Sender<Task<T>>,
    receiver: Receiver<Task<T>>,
    /// Item each worker is currently handling
    slots: Vec<Mutex<Option<T>>>,
    /// Items given up on, or pulled from the queue after cancellation
    parked: Mutex<Vec<T>>,
    /// Items put but not yet handled
    outstanding: Mutex<usize>,
    idle: Condvar,
    cancelled: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Shared<T> {
    fn put(&self, item: T) {
        *lock(&self.outstanding) += 1;
        // Never disconnected: `Shared` owns the receiver
        let _ = self.sender.send(Task::Run(item));
    }

    fn done(&self) {
        let mut outstanding = lock(&self.outstanding);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn queued(&self) -> usize {
        *lock(&self.outstanding)
    }
}

/// Handle given to the job handler for feeding work back into the pool
pub struct Requeue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Requeue<T> {
    /// Queue `item` again
    pub fn put(&self, item: T) {
        self.shared.put(item);
    }

    /// Give up on `item` for this run; it is reported by [`WorkerPool::incomplete`]
    pub fn park(&self, item: T) {
        lock(&self.shared.parked).push(item);
    }

    /// Items waiting or in progress
    pub fn len(&self) -> usize {
        self.shared.queued()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clears a worker's slot once its item is handled
///
/// On unwind the slot keeps the item so it is still reported as incomplete.
struct InFlight<'a, T> {
    shared: &'a Shared<T>,
    index: usize,
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if !thread::panicking() {
            lock(&self.shared.slots[self.index]).take();
        }
        self.shared.done();
    }
}

pub struct WorkerPool<T> {
    shared: Arc<Shared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Clone + Send + 'static> WorkerPool<T> {
    /// Spawn `workers` threads running `handler` on every queued item
    ///
    /// Handler errors are logged; retrying is up to the handler.
    pub fn start<F>(name: &str, workers: usize, handler: F) -> Result<Self>
    where
        F: Fn(T, &Requeue<T>) -> Result<()> + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            sender,
            receiver,
            slots: (0..workers).map(|_| Mutex::new(None)).collect(),
            parked: Mutex::new(Vec::new()),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        let handler = Arc::new(handler);

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            let handler = Arc::clone(&handler);
            let thread_name = format!("{}-{}", name, index);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_worker(&thread_name, index, shared, handler.as_ref()))
                .with_context(|| format!("Failed to spawn worker {}", index))?;
            handles.push(handle);
        }

        Ok(Self { shared, handles })
    }

    pub fn put(&self, item: T) {
        self.shared.put(item);
    }

    /// Items waiting or in progress
    pub fn len(&self) -> usize {
        self.shared.queued()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until the queue is drained, then stop the workers
    ///
    /// Returns early if every worker has died.
    pub fn join(&mut self) {
        {
            let mut outstanding = lock(&self.shared.outstanding);
            while *outstanding > 0 {
                if self.handles.iter().all(JoinHandle::is_finished) {
                    break;
                }
                outstanding = self
                    .shared
                    .idle
                    .wait_timeout(outstanding, Duration::from_millis(100))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
        self.stop();
    }

    /// Stop as soon as in-flight items finish, leaving the queue untouched
    pub fn cancel(&mut self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.stop();
    }

    fn stop(&mut self) {
        for _ in &self.handles {
            let _ = self.shared.sender.send(Task::Stop);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Download worker panicked");
            }
        }

        // Items queued behind the stop markers
        let mut parked = lock(&self.shared.parked);
        for task in self.shared.receiver.try_iter() {
            if let Task::Run(item) = task {
                parked.push(item);
            }
        }
    }

    /// Everything not handled: in flight, parked and still queued
    pub fn incomplete(&self) -> Vec<T> {
        let mut items: Vec<T> = self
            .shared
            .slots
            .iter()
            .filter_map(|slot| lock(slot).clone())
            .collect();
        items.extend(lock(&self.shared.parked).iter().cloned());
        items
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shared.cancelled.store(true, Ordering::SeqCst);
        for _ in &self.handles {
            let _ = self.shared.sender.send(Task::Stop);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_worker<T, F>(name: &str, index: usize, shared: Arc<Shared<T>>, handler: &F)
where
    T: Clone,
    F: Fn(T, &Requeue<T>) -> Result<()>,
{
    let requeue = Requeue {
        shared: Arc::clone(&shared),
    };

    while let Ok(task) = shared.receiver.recv() {
        let Task::Run(item) = task else {
            break;
        };

        if shared.cancelled.load(Ordering::SeqCst) {
            lock(&shared.parked).push(item);
            shared.done();
            continue;
        }

        *lock(&shared.slots[index]) = Some(item.clone());
        let _in_flight = InFlight {
            shared: &shared,
            index,
        };
        if let Err(e) = handler(item, &requeue) {
            error!("{}: {:#}", name, e);
        }
    }

    debug!("{}: stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_join_drains_everything() {
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        let mut pool = WorkerPool::start("test", 4, move |_: u32, _: &Requeue<u32>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        for i in 0..100 {
            pool.put(i);
        }
        pool.join();

        assert_eq!(handled.load(Ordering::SeqCst), 100);
        assert!(pool.incomplete().is_empty());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_requeue_then_park() {
        // Every item fails; first failure re-queues, second parks
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut pool = WorkerPool::start("test", 2, move |item: (u32, u32), queue: &Requeue<(u32, u32)>| {
            counter.fetch_add(1, Ordering::SeqCst);
            if item.1 == 0 {
                queue.put((item.0, 1));
            } else {
                queue.park(item);
            }
            anyhow::bail!("failed {}", item.0)
        })
        .unwrap();

        pool.put((1, 0));
        pool.put((2, 0));
        pool.join();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let mut left = pool.incomplete();
        left.sort();
        assert_eq!(left, vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn test_cancel_keeps_queue() {
        let (started_tx, started_rx) = unbounded::<u32>();
        let (gate_tx, gate_rx) = unbounded::<()>();
        let mut pool = WorkerPool::start("test", 1, move |item: u32, _: &Requeue<u32>| {
            let _ = started_tx.send(item);
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            Ok(())
        })
        .unwrap();

        for i in 0..5 {
            pool.put(i);
        }
        // The single worker holds item 0 until well after the pool is cancelled
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            let _ = gate_tx.send(());
        });
        pool.cancel();
        release.join().unwrap();

        let mut left = pool.incomplete();
        left.sort();
        assert_eq!(left, vec![1, 2, 3, 4]);
        assert!(started_rx.try_recv().is_err());
    }
}
