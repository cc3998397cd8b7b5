//! Condition variables
//!
//! A condition variable is only its wait queue; it pairs with a mutex by
//! convention at each wait. The wait atomically releases the mutex and
//! blocks - there is no preemption point between the two - and a woken
//! waiter owns the mutex again before it returns: signal either grants a
//! free mutex outright or requeues the waiter onto the mutex's own queue,
//! so the handover path is the ordinary lock transfer.

use log::trace;

use crate::kern::obj::ObjectKind;
use crate::kern::sched::Kernel;
use crate::types::{Error, ObjectId, Outcome, ThreadId, Ticks, TrapResult};

impl Kernel {
    /// Atomically release `mutex` and block on `cond`.
    pub fn cond_wait(&mut self, th: ThreadId, cond: ObjectId, mutex: ObjectId) -> TrapResult {
        self.cond_wait_start(th, cond, mutex, None)
    }

    /// [`Kernel::cond_wait`] with a timeout. A timeout result means the
    /// caller does not hold the mutex.
    pub fn cond_wait_timed(
        &mut self,
        th: ThreadId,
        cond: ObjectId,
        mutex: ObjectId,
        ms: Ticks,
    ) -> TrapResult {
        Self::check_timeout(ms)?;
        self.cond_wait_start(th, cond, mutex, Some(ms))
    }

    fn cond_wait_start(
        &mut self,
        th: ThreadId,
        cond: ObjectId,
        mutex: ObjectId,
        timeout: Option<Ticks>,
    ) -> TrapResult {
        self.obj_check(cond, ObjectKind::Cond)?;
        let midx = self.obj_check(mutex, ObjectKind::Mutex)?;
        if self.mutex_owner[midx] != Some(th) {
            return Err(Error::NotOwner);
        }

        // Block first, then hand the mutex over; both happen inside this
        // trap, so no other thread can slip in between.
        match timeout {
            Some(ms) => {
                self.wq_insert_timed(cond.index(), th, ms);
                self.retval_set(th, Error::Timeout.code() as u32);
            }
            None => {
                self.wq_insert(cond.index(), th);
                self.retval_set(th, 0);
            }
        }
        self.cond_pair[th.index()] = Some(mutex);
        self.mutex_transfer(midx, mutex.index());
        self.defer_sched();
        trace!("{} waits on {} (mutex {})", th, cond, mutex);
        Ok(Outcome::Blocked)
    }

    /// Release one waiter. The waiter returns holding its paired mutex:
    /// either granted here or after queueing on the mutex like any other
    /// contender.
    pub fn cond_signal(&mut self, cond: ObjectId) -> TrapResult {
        self.obj_check(cond, ObjectKind::Cond)?;
        if let Some(th) = self.wq_head(cond.index()) {
            self.cond_release(cond, th);
            self.defer_sched();
        }
        Ok(Outcome::Done(0))
    }

    /// Release every waiter, lowest id first.
    pub fn cond_broadcast(&mut self, cond: ObjectId) -> TrapResult {
        self.obj_check(cond, ObjectKind::Cond)?;
        let mut released = false;
        while let Some(th) = self.wq_head(cond.index()) {
            self.cond_release(cond, th);
            released = true;
        }
        if released {
            self.defer_sched();
        }
        Ok(Outcome::Done(0))
    }

    /// Move one waiter off the condition queue and re-acquire its mutex.
    fn cond_release(&mut self, cond: ObjectId, th: ThreadId) {
        let mutex = self.cond_pair[th.index()];
        self.cond_pair[th.index()] = None;

        let mutex = match mutex {
            Some(m) => m,
            // Pairing lost (mutex freed while waiting): plain wakeup.
            None => {
                self.wakeup(cond.index(), th);
                return;
            }
        };
        let midx = match self.obj_check(mutex, ObjectKind::Mutex) {
            Ok(i) => i,
            Err(_) => {
                self.wakeup_return(cond.index(), th, Error::Canceled.code() as u32);
                return;
            }
        };

        if self.mutex_owner[midx].is_none() {
            // Mutex free: grant it and wake the thread.
            self.mutex_owner[midx] = Some(th);
            self.wakeup(cond.index(), th);
        } else {
            // Mutex held: requeue onto the mutex queue, keeping any armed
            // timeout. The eventual unlock-transfer completes the wait.
            let clocked = self.thread_is_clocked(th);
            self.wq[cond.index()] &= !th.bit();
            self.wq[mutex.index()] |= th.bit();
            self.stat_set(th, mutex.index(), clocked);
            trace!("{} requeued from {} to mutex {}", th, cond, mutex);
        }
    }
}
