//! Worker-pool context.
//!
//! Multi-threaded variant of the execution context: `N` worker threads
//! pull from the ready queue, one dedicated thread polls the timer
//! wheel. The pool has no I/O service (its service handle is inert).
//!
//! State machine: `Stop -> Running -> PendingDestroy`. Workers and the
//! timer thread park on their condition variables while stopped and exit
//! on `PendingDestroy`. An expired timer is posted to the ready queue,
//! never executed on the timer thread, so timer callbacks obey the same
//! scheduling discipline as ordinary tasks.
//!
//! `post` and `set_timeout` raise an in-flight counter; task completion
//! lowers it. [`wait`](ThreadPool::wait) parks on a condvar signalled by
//! the last decrement, so when it returns every hook and task that was
//! outstanding has finished and its effects are visible (the counter is
//! raised with acquire and lowered with release ordering).

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use corio_core::{RingQueue, Task, TimerId};

use crate::context::ExecutionContext;
use crate::service::IoService;
use crate::timer::TimerWheel;
use crate::tls;

const STATE_STOP: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_PENDING_DESTROY: u8 = 2;

struct PoolShared {
    state: AtomicU8,
    posted: Mutex<RingQueue<Task>>,
    posted_cv: Condvar,
    wheel: Mutex<TimerWheel>,
    timed_cv: Condvar,
    /// Posted tasks plus armed timers that have not finished yet.
    count: AtomicUsize,
    idle: Mutex<()>,
    idle_cv: Condvar,
    service: IoService,
}

impl PoolShared {
    #[inline]
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Store the state under both queue mutexes so neither condvar can
    /// miss the transition, then wake everyone.
    fn set_state(&self, state: u8) {
        {
            let _guard = self.posted.lock().unwrap();
            self.state.store(state, Ordering::Release);
        }
        self.posted_cv.notify_all();
        {
            let _guard = self.wheel.lock().unwrap();
            self.state.store(state, Ordering::Release);
        }
        self.timed_cv.notify_all();
    }

    /// Lower the in-flight counter; the last decrement releases waiters.
    fn finish_one(&self) {
        if self.count.fetch_sub(1, Ordering::Release) == 1 {
            let _guard = self.idle.lock().unwrap();
            self.idle_cv.notify_all();
        }
    }
}

impl ExecutionContext for PoolShared {
    fn post(&self, task: Task) {
        self.count.fetch_add(1, Ordering::Acquire);
        {
            let mut queue = self.posted.lock().unwrap();
            queue.push(task);
        }
        self.posted_cv.notify_one();
    }

    fn dispatch(&self, task: Task) {
        // Workers are interchangeable; there is no inline fast path.
        self.post(task);
    }

    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId {
        self.count.fetch_add(1, Ordering::Acquire);
        let id = self.wheel.lock().unwrap().set_timeout(delay, task);
        self.timed_cv.notify_one();
        id
    }

    fn clear(&self, id: TimerId) {
        let removed = self.wheel.lock().unwrap().cancel(id);
        if removed {
            self.finish_one();
        }
    }

    fn service(&self) -> &IoService {
        &self.service
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let _guard = tls::enter(shared.clone() as Arc<dyn ExecutionContext>);
    loop {
        let task = {
            let mut queue = shared.posted.lock().unwrap();
            loop {
                match shared.state() {
                    STATE_PENDING_DESTROY => return,
                    STATE_RUNNING if !queue.is_empty() => break queue.pop().unwrap(),
                    _ => queue = shared.posted_cv.wait(queue).unwrap(),
                }
            }
        };
        task();
        shared.finish_one();
    }
}

fn timer_loop(shared: Arc<PoolShared>) {
    loop {
        let mut wheel = shared.wheel.lock().unwrap();
        match shared.state() {
            STATE_PENDING_DESTROY => return,
            STATE_RUNNING => {
                let expired = wheel.drain_expired(Instant::now());
                if !expired.is_empty() {
                    drop(wheel);
                    for task in expired {
                        // The timer's in-flight count transfers to the
                        // posted task: post raises it, then the timer's
                        // own count is released.
                        shared.post(task);
                        shared.finish_one();
                    }
                    continue;
                }
                match wheel.next_deadline() {
                    Some(deadline) => {
                        let until = deadline.saturating_duration_since(Instant::now());
                        if until.is_zero() {
                            continue;
                        }
                        let (guard, _) = shared.timed_cv.wait_timeout(wheel, until).unwrap();
                        drop(guard);
                    }
                    None => drop(shared.timed_cv.wait(wheel).unwrap()),
                }
            }
            _ => drop(shared.timed_cv.wait(wheel).unwrap()),
        }
    }
}

/// Multi-threaded execution context without I/O.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    joined: AtomicBool,
}

impl ThreadPool {
    /// Spawn `workers` worker threads plus the timer thread and start
    /// running. `workers == 0` is valid; combine it with
    /// [`attach`](Self::attach) to donate calling threads instead.
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: AtomicU8::new(STATE_STOP),
            posted: Mutex::new(RingQueue::new()),
            posted_cv: Condvar::new(),
            wheel: Mutex::new(TimerWheel::new()),
            timed_cv: Condvar::new(),
            count: AtomicUsize::new(0),
            idle: Mutex::new(()),
            idle_cv: Condvar::new(),
            service: IoService::disabled(),
        });

        let mut threads = Vec::with_capacity(workers + 1);
        for i in 0..workers {
            let shared_clone = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("corio-worker-{}", i))
                .spawn(move || worker_loop(shared_clone))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        let shared_clone = shared.clone();
        let handle = std::thread::Builder::new()
            .name("corio-timer".into())
            .spawn(move || timer_loop(shared_clone))
            .expect("failed to spawn timer thread");
        threads.push(handle);

        let pool = Self {
            shared,
            threads: Mutex::new(threads),
            joined: AtomicBool::new(false),
        };
        pool.run();
        pool
    }

    /// Resume task execution after a [`stop`](Self::stop).
    pub fn run(&self) {
        self.shared.set_state(STATE_RUNNING);
    }

    /// Pause task execution. Queued work stays queued; threads park.
    pub fn stop(&self) {
        self.shared.set_state(STATE_STOP);
    }

    /// Block until the in-flight counter reaches zero: every posted task
    /// has run and every armed timer has fired or been cleared.
    pub fn wait(&self) {
        let mut guard = self.shared.idle.lock().unwrap();
        while self.shared.count.load(Ordering::Acquire) != 0 {
            guard = self.shared.idle_cv.wait(guard).unwrap();
        }
    }

    /// Drain outstanding work, then shut the threads down and join them.
    /// Idempotent; also runs on drop.
    pub fn join(&self) {
        if self.joined.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wait();
        self.shared.set_state(STATE_PENDING_DESTROY);
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// Run the worker loop on the calling thread until the pool is
    /// destroyed. Makes this pool the thread's current context for the
    /// duration.
    pub fn attach(&self) {
        worker_loop(self.shared.clone());
    }

    /// This context as a trait-object handle.
    pub fn handle(&self) -> Arc<dyn ExecutionContext> {
        self.shared.clone()
    }

    pub fn post(&self, task: Task) {
        self.shared.post(task);
    }

    pub fn dispatch(&self, task: Task) {
        self.shared.dispatch(task);
    }

    pub fn set_timeout(&self, delay: Duration, task: Task) -> TimerId {
        self.shared.set_timeout(delay, task)
    }

    pub fn clear(&self, id: TimerId) {
        self.shared.clear(id);
    }

    pub fn service(&self) -> &IoService {
        self.shared.service()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_posted_tasks_all_run() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let c = counter.clone();
            pool.post(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        pool.join();
    }

    #[test]
    fn test_wait_observes_all_side_effects() {
        let pool = ThreadPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let c = counter.clone();
            pool.post(Box::new(move || {
                std::thread::sleep(Duration::from_millis(5));
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.wait();
        // Release/acquire on the counter pairs every task's effects with
        // this read.
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_timer_callback_runs_on_worker() {
        let pool = ThreadPool::new(2);
        let fired_on = Arc::new(Mutex::new(String::new()));
        let fired_on2 = fired_on.clone();

        pool.set_timeout(
            Duration::from_millis(20),
            Box::new(move || {
                let name = std::thread::current().name().unwrap_or("").to_string();
                *fired_on2.lock().unwrap() = name;
            }),
        );

        pool.wait();
        let name = fired_on.lock().unwrap().clone();
        assert!(name.starts_with("corio-worker-"), "ran on {:?}", name);
    }

    #[test]
    fn test_cleared_timer_releases_wait() {
        let pool = ThreadPool::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let id = pool.set_timeout(
            Duration::from_secs(30),
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        pool.clear(id);

        // Without the clear this would park for 30 seconds.
        pool.wait();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_parks_queued_work() {
        let pool = ThreadPool::new(2);
        pool.stop();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.post(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.run();
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attach_donates_calling_thread() {
        let pool = Arc::new(ThreadPool::new(0));
        let counter = Arc::new(AtomicUsize::new(0));

        let pool2 = pool.clone();
        let donor = std::thread::spawn(move || pool2.attach());

        for _ in 0..10 {
            let c = counter.clone();
            pool.post(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.join();
        donor.join().unwrap();
    }

    #[test]
    fn test_workers_see_current_context() {
        let pool = ThreadPool::new(1);
        let attached = Arc::new(AtomicUsize::new(0));
        let attached2 = attached.clone();

        pool.post(Box::new(move || {
            if tls::is_attached() {
                attached2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        pool.wait();
        assert_eq!(attached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_is_idempotent() {
        let pool = ThreadPool::new(2);
        pool.post(Box::new(|| {}));
        pool.join();
        pool.join();
    }

    #[test]
    fn test_service_is_disabled() {
        let pool = ThreadPool::new(1);
        assert!(!pool.service().is_enabled());
        pool.join();
    }
}
