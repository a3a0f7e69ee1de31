// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The behaviour runtime the VM core consumes: concurrent-owner (cown)
//! scheduling queues, a worker thread pool, and external-event-source
//! counting so the runtime refuses to exit while IO is pending.
//!
//! A behaviour is a unit of work that acquires a set of cowns before it
//! runs. Acquisition is two-phase: every behaviour enqueues into all of its
//! cowns' FIFO queues atomically, then runs once every slot has been
//! granted. Per cown, writers are exclusive and FIFO-ordered; consecutive
//! readers are granted together and may run concurrently.

mod cown;
mod scheduler;

pub use cown::{CownHandle, Slot};
pub use scheduler::Scheduler;
