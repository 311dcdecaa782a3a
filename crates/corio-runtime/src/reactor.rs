//! Single-threaded reactor context.
//!
//! Owns one I/O service, one timer wheel, and one ready queue. The loop
//! alternates three phases: run ready tasks (bounded per iteration so a
//! flood of posts cannot starve timers and I/O), move expired timers to
//! the ready queue, then block in the service until a completion arrives,
//! the next timer is due, or a cross-thread post wakes it.
//!
//! All tasks and all completion hooks run on the loop thread, so user
//! code on a reactor never races itself. Tasks posted from the loop
//! thread run in program order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use corio_core::{cio_error, ErrorCode, IoResult, RingQueue, Task, TimerId};

use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::service::IoService;
use crate::timer::TimerWheel;
use crate::tls;

/// Ready tasks run per loop iteration before timers and I/O get a turn.
const TASK_BUDGET: usize = 128;

struct ReactorShared {
    service: IoService,
    ready: Mutex<RingQueue<Task>>,
    wheel: Mutex<TimerWheel>,
    stop: AtomicBool,
    running: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl ReactorShared {
    fn on_loop_thread(&self) -> bool {
        *self.loop_thread.lock().unwrap() == Some(std::thread::current().id())
    }
}

impl ExecutionContext for ReactorShared {
    fn post(&self, task: Task) {
        self.ready.lock().unwrap().push(task);
        self.service.notify();
    }

    fn dispatch(&self, task: Task) {
        if self.on_loop_thread() && self.running.load(Ordering::Acquire) {
            task();
        } else {
            self.post(task);
        }
    }

    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId {
        let id = self.wheel.lock().unwrap().set_timeout(delay, task);
        // A sleeping loop may now have an earlier deadline.
        self.service.notify();
        id
    }

    fn clear(&self, id: TimerId) {
        self.wheel.lock().unwrap().cancel(id);
    }

    fn service(&self) -> &IoService {
        &self.service
    }
}

/// Single-threaded execution context that owns an I/O service.
///
/// Cloning yields another handle to the same context, so closures can
/// carry a way to stop the loop or arm timers.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<ReactorShared>,
}

impl Reactor {
    pub fn new() -> IoResult<Self> {
        Self::with_config(&RuntimeConfig::from_env())
    }

    pub fn with_config(config: &RuntimeConfig) -> IoResult<Self> {
        Ok(Self {
            shared: Arc::new(ReactorShared {
                service: IoService::new(config.max_inflight)?,
                ready: Mutex::new(RingQueue::new()),
                wheel: Mutex::new(TimerWheel::new()),
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                loop_thread: Mutex::new(None),
            }),
        })
    }

    /// Enter the loop on the calling thread. Returns when
    /// [`stop`](Self::stop) is requested, or with the error that made the
    /// service unusable. The context can be re-run afterwards.
    pub fn run(&self) -> IoResult<()> {
        let shared = &self.shared;
        if shared.running.swap(true, Ordering::AcqRel) {
            return Err(ErrorCode::InvalidArgument);
        }
        shared.stop.store(false, Ordering::Release);
        *shared.loop_thread.lock().unwrap() = Some(std::thread::current().id());

        let guard = tls::enter(shared.clone() as Arc<dyn ExecutionContext>);
        let result = self.run_loop();
        drop(guard);

        *shared.loop_thread.lock().unwrap() = None;
        shared.running.store(false, Ordering::Release);
        result
    }

    /// Ask the loop to exit after the current iteration. Callable from
    /// any thread.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.service.notify();
    }

    /// Make this context the calling thread's current context until the
    /// guard drops. [`run`](Self::run) does this implicitly; use this to
    /// set up sockets and files before entering the loop.
    pub fn attach(&self) -> tls::ContextGuard {
        tls::enter(self.shared.clone() as Arc<dyn ExecutionContext>)
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

    fn run_loop(&self) -> IoResult<()> {
        let shared = &self.shared;
        loop {
            let now = Instant::now();

            // Phase 1: ready tasks, bounded.
            let mut budget = TASK_BUDGET;
            while budget > 0 {
                let task = shared.ready.lock().unwrap().pop();
                match task {
                    Some(task) => {
                        task();
                        budget -= 1;
                    }
                    None => break,
                }
            }

            // Phase 2: expired timers join the ready queue; they run next
            // iteration under the same discipline as posted tasks.
            let expired = shared.wheel.lock().unwrap().drain_expired(now);
            if !expired.is_empty() {
                let mut ready = shared.ready.lock().unwrap();
                for task in expired {
                    ready.push(task);
                }
            }

            if shared.stop.load(Ordering::Acquire) {
                return Ok(());
            }

            // Phase 3: block in the service. Zero timeout when work is
            // already queued, next-deadline bound when a timer is armed,
            // indefinite otherwise.
            let timeout = if !shared.ready.lock().unwrap().is_empty() {
                Some(Duration::ZERO)
            } else {
                shared
                    .wheel
                    .lock()
                    .unwrap()
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            };

            if let Err(e) = shared.service.poll(timeout) {
                cio_error!("reactor: service poll failed: {}", e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_posted_tasks_run_in_program_order() {
        let reactor = Reactor::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let r = reactor.clone();
        let order2 = order.clone();
        reactor.post(Box::new(move || {
            // Posts issued from the loop thread keep program order.
            for i in 0..5 {
                let order3 = order2.clone();
                r.post(Box::new(move || order3.lock().unwrap().push(i)));
            }
            let r2 = r.clone();
            r.post(Box::new(move || r2.stop()));
        }));

        reactor.run().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_dispatch_runs_inline_on_loop_thread() {
        let reactor = Reactor::new().unwrap();
        let r = reactor.clone();
        let inline = Arc::new(AtomicBool::new(false));
        let inline2 = inline.clone();

        reactor.post(Box::new(move || {
            let flag = inline2.clone();
            r.dispatch(Box::new(move || flag.store(true, Ordering::SeqCst)));
            // dispatch on the loop thread runs before we get here
            assert!(inline2.load(Ordering::SeqCst));
            r.stop();
        }));

        reactor.run().unwrap();
        assert!(inline.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let reactor = Reactor::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay_ms, tag) in [(30u64, 30u32), (10, 10), (20, 20)] {
            let order2 = order.clone();
            let r = reactor.clone();
            reactor.set_timeout(
                Duration::from_millis(delay_ms),
                Box::new(move || {
                    let mut order = order2.lock().unwrap();
                    order.push(tag);
                    if order.len() == 3 {
                        r.stop();
                    }
                }),
            );
        }

        let start = Instant::now();
        reactor.run().unwrap();
        let elapsed = start.elapsed();

        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed <= Duration::from_millis(60), "elapsed {:?}", elapsed);
    }

    #[test]
    fn test_cleared_timer_never_fires() {
        let reactor = Reactor::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let id = reactor.set_timeout(
            Duration::from_millis(10),
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        reactor.clear(id);

        let r = reactor.clone();
        reactor.set_timeout(Duration::from_millis(30), Box::new(move || r.stop()));
        reactor.run().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cross_thread_post_wakes_loop() {
        let reactor = Reactor::new().unwrap();
        let r = reactor.clone();

        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let r2 = r.clone();
            r.post(Box::new(move || r2.stop()));
        });

        let start = Instant::now();
        reactor.run().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        poster.join().unwrap();
    }

    #[test]
    fn test_reactor_can_be_rerun() {
        let reactor = Reactor::new().unwrap();
        for _ in 0..2 {
            let r = reactor.clone();
            reactor.post(Box::new(move || r.stop()));
            reactor.run().unwrap();
        }
    }

    #[test]
    fn test_current_context_set_during_run() {
        let reactor = Reactor::new().unwrap();
        let r = reactor.clone();
        let attached = Arc::new(AtomicBool::new(false));
        let attached2 = attached.clone();

        assert!(!tls::is_attached());
        reactor.post(Box::new(move || {
            attached2.store(tls::is_attached(), Ordering::SeqCst);
            r.stop();
        }));
        reactor.run().unwrap();

        assert!(attached.load(Ordering::SeqCst));
        assert!(!tls::is_attached());
    }
}
