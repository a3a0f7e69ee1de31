// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::scheduler::Behavior;

/// Scheduling state of one cown. The owner of the data guarded by the cown
/// keeps a [`CownHandle`] and passes clones of it in [`Slot`]s when
/// scheduling behaviours.
#[derive(Clone)]
pub struct CownHandle {
    pub(crate) state: Arc<CownState>,
}

impl CownHandle {
    pub fn new() -> CownHandle {
        CownHandle {
            state: Arc::new(CownState {
                queue: Mutex::new(CownQueue {
                    active_readers: 0,
                    active_writer: false,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Stable identity for lock ordering.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.state) as usize
    }
}

impl Default for CownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One cown acquisition of a behaviour.
pub struct Slot {
    pub cown: CownHandle,
    pub read_only: bool,
}

pub(crate) struct CownState {
    pub(crate) queue: Mutex<CownQueue>,
}

pub(crate) struct CownQueue {
    pub(crate) active_readers: usize,
    pub(crate) active_writer: bool,
    pub(crate) waiters: VecDeque<Waiter>,
}

pub(crate) struct Waiter {
    pub(crate) behavior: Arc<Behavior>,
    pub(crate) read_only: bool,
}

impl CownQueue {
    /// Whether a new request can be granted immediately. Anything queued
    /// behind other waiters must wait its turn regardless of compatibility,
    /// preserving per-cown FIFO.
    pub(crate) fn can_grant(&self, read_only: bool) -> bool {
        if !self.waiters.is_empty() || self.active_writer {
            return false;
        }
        read_only || self.active_readers == 0
    }

    pub(crate) fn grant(&mut self, read_only: bool) {
        if read_only {
            self.active_readers += 1;
        } else {
            self.active_writer = true;
        }
    }

    pub(crate) fn release(&mut self, read_only: bool) {
        if read_only {
            debug_assert!(self.active_readers > 0);
            self.active_readers -= 1;
        } else {
            debug_assert!(self.active_writer);
            self.active_writer = false;
        }
    }

    /// Pop every waiter that can now run: the front writer once the cown is
    /// quiescent, or the maximal run of front readers.
    pub(crate) fn advance(&mut self) -> Vec<Arc<Behavior>> {
        let mut granted = Vec::new();
        if self.active_writer {
            return granted;
        }
        while let Some(front) = self.waiters.front() {
            if front.read_only {
                self.active_readers += 1;
                granted.push(self.waiters.pop_front().unwrap().behavior);
            } else {
                if self.active_readers == 0 && granted.is_empty() {
                    self.active_writer = true;
                    granted.push(self.waiters.pop_front().unwrap().behavior);
                }
                break;
            }
        }
        granted
    }
}
