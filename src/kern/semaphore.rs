//! Counting semaphores
//!
//! `post` wakes a queued thread directly instead of incrementing, so a
//! wakeup can never be lost to a counter overshoot; with no waiter the
//! counter absorbs the post. The counter is unsigned and can never be
//! observed negative.

use log::trace;

use crate::kern::obj::ObjectKind;
use crate::kern::sched::Kernel;
use crate::types::{Error, ObjectId, Outcome, ThreadId, Ticks, TrapResult};

impl Kernel {
    /// Reset a semaphore's counter.
    pub fn sem_init(&mut self, oid: ObjectId, value: u32) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Semaphore)?;
        self.sem_val[idx] = value;
        Ok(Outcome::Done(0))
    }

    /// Take one unit, blocking while the counter is zero.
    pub fn sem_wait(&mut self, th: ThreadId, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Semaphore)?;

        if self.sem_val[idx] > 0 {
            self.sem_val[idx] -= 1;
            return Ok(Outcome::Done(0));
        }
        self.wq_insert(oid.index(), th);
        self.retval_set(th, 0);
        self.defer_sched();
        trace!("{} waits on {}", th, oid);
        Ok(Outcome::Blocked)
    }

    /// Take one unit without blocking.
    pub fn sem_try_wait(&mut self, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Semaphore)?;
        if self.sem_val[idx] > 0 {
            self.sem_val[idx] -= 1;
            Ok(Outcome::Done(0))
        } else {
            Err(Error::Again)
        }
    }

    /// Take one unit or give up after `ms` ticks.
    pub fn sem_wait_timed(&mut self, th: ThreadId, oid: ObjectId, ms: Ticks) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Semaphore)?;
        Self::check_timeout(ms)?;

        if self.sem_val[idx] > 0 {
            self.sem_val[idx] -= 1;
            return Ok(Outcome::Done(0));
        }
        self.wq_insert_timed(oid.index(), th, ms);
        // Default result is the timeout; a post rewrites it to 0.
        self.retval_set(th, Error::Timeout.code() as u32);
        self.defer_sched();
        Ok(Outcome::Blocked)
    }

    /// Give one unit: wake the lowest-numbered waiter, or increment.
    pub fn sem_post(&mut self, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Semaphore)?;
        self.sem_post_raw(idx, oid.index());
        self.defer_sched();
        Ok(Outcome::Done(0))
    }

    /// Interrupt-level post: identical state change, but preemption is
    /// requested instead of a plain defer so a masked critical section
    /// holds it back.
    pub fn sem_post_isr(&mut self, oid: ObjectId) -> Result<(), Error> {
        let idx = self.obj_check(oid, ObjectKind::Semaphore)?;
        self.sem_post_raw(idx, oid.index());
        self.preempt();
        Ok(())
    }

    fn sem_post_raw(&mut self, idx: usize, wq: usize) {
        match self.wake_one(wq) {
            Some(th) => trace!("sem post wakes {}", th),
            None => self.sem_val[idx] += 1,
        }
    }

    /// Current counter value, for introspection and tests.
    pub fn sem_value(&self, oid: ObjectId) -> Result<u32, Error> {
        let idx = self.obj_check(oid, ObjectKind::Semaphore)?;
        Ok(self.sem_val[idx])
    }
}
