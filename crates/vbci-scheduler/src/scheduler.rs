// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::cown::{Slot, Waiter};

type Work = Box<dyn FnOnce() + Send + 'static>;

/// A scheduled unit of work plus the cown slots it must hold before it runs.
pub(crate) struct Behavior {
    /// Ungranted slots remaining, plus one guard unit held while the
    /// behaviour is still being enqueued.
    pending: AtomicUsize,
    work: Mutex<Option<Work>>,
    slots: Vec<Slot>,
}

struct Shared {
    run_queue: Mutex<VecDeque<Arc<Behavior>>>,
    work_available: Condvar,
    /// Serialises multi-cown enqueue so behaviours hit all their queues in
    /// one atomic step; this is what makes per-cown FIFO globally coherent.
    schedule_lock: Mutex<()>,
    /// Outstanding behaviours, plain work items and external event sources.
    live: Mutex<isize>,
    idle: Condvar,
    shutdown: AtomicBool,
}

/// The worker pool and admission queues behind `when`.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(threads: usize) -> Scheduler {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            run_queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            schedule_lock: Mutex::new(()),
            live: Mutex::new(0),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("vbci-worker-{i}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn scheduler worker");
            workers.push(handle);
        }

        Scheduler {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Pool sized to the host, as the underlying runtime would be.
    pub fn with_default_threads() -> Scheduler {
        Scheduler::new(num_cpus::get())
    }

    /// Schedule a behaviour against a set of cown slots.
    pub fn schedule_behavior(&self, slots: Vec<Slot>, work: Work) {
        self.track(1);
        let behavior = Arc::new(Behavior {
            // One unit per slot plus the enqueue guard.
            pending: AtomicUsize::new(slots.len() + 1),
            work: Mutex::new(Some(work)),
            slots,
        });

        // Acquire in a canonical order while holding the schedule lock, so
        // concurrent multi-cown behaviours cannot interleave their enqueues.
        let mut order: Vec<usize> = (0..behavior.slots.len()).collect();
        order.sort_by_key(|&i| behavior.slots[i].cown.addr());

        let mut granted = 1; // the enqueue guard
        {
            let _guard = self.shared.schedule_lock.lock();
            for &i in &order {
                let slot = &behavior.slots[i];
                let mut queue = slot.cown.state.queue.lock();
                if queue.can_grant(slot.read_only) {
                    queue.grant(slot.read_only);
                    granted += 1;
                } else {
                    queue.waiters.push_back(Waiter {
                        behavior: behavior.clone(),
                        read_only: slot.read_only,
                    });
                }
            }
        }
        self.resolve(&behavior, granted);
    }

    /// Schedule a plain work item with no cown dependencies.
    pub fn schedule_work(&self, work: Work) {
        self.schedule_behavior(Vec::new(), work);
    }

    /// Register an external event source (live IO). The scheduler will not
    /// report idle while any is outstanding.
    pub fn add_external_event_source(&self) {
        self.track(1);
    }

    pub fn remove_external_event_source(&self) {
        self.track(-1);
    }

    /// Block until every behaviour has run and no external event sources
    /// remain.
    pub fn wait_idle(&self) {
        let mut live = self.shared.live.lock();
        while *live > 0 {
            self.shared.idle.wait(&mut live);
        }
    }

    fn track(&self, delta: isize) {
        let mut live = self.shared.live.lock();
        *live += delta;
        if *live == 0 {
            self.shared.idle.notify_all();
        }
    }

    fn resolve(&self, behavior: &Arc<Behavior>, units: usize) {
        if behavior.pending.fetch_sub(units, Ordering::AcqRel) == units {
            self.shared.enqueue(behavior.clone());
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work_available.notify_all();
        for handle in self.workers.lock().drain(..) {
            handle.join().ok();
        }
    }
}

impl Shared {
    fn enqueue(&self, behavior: Arc<Behavior>) {
        self.run_queue.lock().push_back(behavior);
        self.work_available.notify_one();
    }

    fn finish(&self, behavior: Arc<Behavior>) {
        // Release every slot and wake whatever is now at the front.
        for slot in &behavior.slots {
            let granted = {
                let mut queue = slot.cown.state.queue.lock();
                queue.release(slot.read_only);
                queue.advance()
            };
            for waiter in granted {
                if waiter.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.enqueue(waiter);
                }
            }
        }

        let mut live = self.live.lock();
        *live -= 1;
        if *live == 0 {
            self.idle.notify_all();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let behavior = {
            let mut queue = shared.run_queue.lock();
            loop {
                if let Some(b) = queue.pop_front() {
                    break b;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.work_available.wait(&mut queue);
            }
        };

        let work = behavior.work.lock().take();
        if let Some(work) = work {
            trace!("running behaviour");
            work();
        }
        shared.finish(behavior);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cown::CownHandle;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn write_slot(cown: &CownHandle) -> Slot {
        Slot {
            cown: cown.clone(),
            read_only: false,
        }
    }

    fn read_slot(cown: &CownHandle) -> Slot {
        Slot {
            cown: cown.clone(),
            read_only: true,
        }
    }

    #[test]
    fn plain_work_runs_and_idles() {
        let sched = Scheduler::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            sched.schedule_work(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        sched.wait_idle();
        assert_eq!(counter.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn writer_behaviours_are_fifo_per_cown() {
        let sched = Scheduler::new(4);
        let cown = CownHandle::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let order = order.clone();
            sched.schedule_behavior(
                vec![write_slot(&cown)],
                Box::new(move || {
                    order.lock().push(i);
                }),
            );
        }
        sched.wait_idle();
        assert_eq!(*order.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn readers_share_but_exclude_writers() {
        let sched = Scheduler::new(4);
        let cown = CownHandle::new();
        let writer_running = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicU32::new(0));

        for i in 0..24 {
            let writer_running = writer_running.clone();
            let violations = violations.clone();
            if i % 6 == 0 {
                sched.schedule_behavior(
                    vec![write_slot(&cown)],
                    Box::new(move || {
                        writer_running.store(true, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        writer_running.store(false, Ordering::SeqCst);
                    }),
                );
            } else {
                sched.schedule_behavior(
                    vec![read_slot(&cown)],
                    Box::new(move || {
                        if writer_running.load(Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                );
            }
        }
        sched.wait_idle();
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn multi_cown_behaviours_do_not_deadlock() {
        let sched = Scheduler::new(4);
        let a = CownHandle::new();
        let b = CownHandle::new();
        let hits = Arc::new(AtomicU32::new(0));
        for i in 0..64 {
            let hits = hits.clone();
            // Alternate acquisition order; the canonical sort must prevent
            // a deadlock.
            let slots = if i % 2 == 0 {
                vec![write_slot(&a), write_slot(&b)]
            } else {
                vec![write_slot(&b), write_slot(&a)]
            };
            sched.schedule_behavior(
                slots,
                Box::new(move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        sched.wait_idle();
        assert_eq!(hits.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn external_sources_hold_idle() {
        let sched = Arc::new(Scheduler::new(1));
        sched.add_external_event_source();
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let sched = sched.clone();
            let flag = flag.clone();
            thread::spawn(move || {
                sched.wait_idle();
                flag.load(Ordering::SeqCst)
            })
        };

        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::SeqCst);
        sched.remove_external_event_source();
        assert!(waiter.join().unwrap());
    }
}
