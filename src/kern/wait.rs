//! Wait queues - bitmap blocking primitives
//!
//! Every blocking object is a `u32` bitset of thread ids plus a reverse
//! lookup entry per thread. Insert/remove are O(1) bit operations, callable
//! only from trap or interrupt level. Wake order is the lowest-numbered set
//! bit - a deterministic function of thread id, not arrival time - and
//! other code depends on that tie-break exactly.
//!
//! A timed wait inserts into the target queue and the clock queue
//! simultaneously; whichever fires first removes the thread from both, so
//! a timeout resolves exactly once.

use log::trace;

use crate::kern::sched::{WQ_CLOCK, WQ_READY};
use crate::types::{ThreadId, Ticks};

use super::sched::Kernel;

impl Kernel {
    // ------------------------------------------------------------------------
    // Reverse lookup (thread status)
    // ------------------------------------------------------------------------

    #[inline]
    pub(crate) fn stat_set(&mut self, th: ThreadId, wq: usize, clocked: bool) {
        self.stat[th.index()] = ((wq as u16) << 1) | clocked as u16;
    }

    #[inline]
    pub(crate) fn stat_clr(&mut self, th: ThreadId) {
        self.stat[th.index()] = 0;
    }

    /// Wait queue a thread is blocked on, if any.
    pub fn thread_wait_queue(&self, th: ThreadId) -> Option<usize> {
        let stat = self.stat[th.index()];
        if stat == 0 {
            None
        } else {
            Some((stat >> 1) as usize)
        }
    }

    /// Whether a blocked thread also has a timeout armed.
    pub fn thread_is_clocked(&self, th: ThreadId) -> bool {
        self.stat[th.index()] & 1 != 0
    }

    // ------------------------------------------------------------------------
    // Queue membership
    // ------------------------------------------------------------------------

    /// Lowest-numbered waiter of a queue, or `None`.
    #[inline]
    pub(crate) fn wq_head(&self, wq: usize) -> Option<ThreadId> {
        let set = self.wq[wq];
        if set == 0 {
            None
        } else {
            Some(ThreadId(set.trailing_zeros() as u8))
        }
    }

    /// Number of waiters on a queue.
    pub fn wq_count(&self, wq: usize) -> u32 {
        self.wq[wq].count_ones()
    }

    /// Block `th` on `wq`: remove from ready, enqueue, record the reverse
    /// lookup. The caller flags the deferred reschedule.
    pub(crate) fn wq_insert(&mut self, wq: usize, th: ThreadId) {
        self.suspend(th);
        self.wq[wq] |= th.bit();
        self.stat_set(th, wq, false);
        trace!("{} waits on #{}", th, wq);
    }

    /// Block `th` on `wq` with a timeout `ms` ticks from now: enqueue on
    /// both the target and the clock queues.
    pub(crate) fn wq_insert_timed(&mut self, wq: usize, th: ThreadId, ms: Ticks) {
        self.suspend(th);
        self.clock[th.index()] = self.ticks.wrapping_add(ms);
        self.wq[wq] |= th.bit();
        self.wq[WQ_CLOCK] |= th.bit();
        self.stat_set(th, wq, true);
        trace!("{} waits on #{} for {}ms", th, wq, ms);
    }

    /// Remove `th` from `wq` and from the clock queue, without waking it.
    pub(crate) fn wq_remove(&mut self, wq: usize, th: ThreadId) {
        self.wq[wq] &= !th.bit();
        self.wq[WQ_CLOCK] &= !th.bit();
        self.stat_clr(th);
    }

    // ------------------------------------------------------------------------
    // Wakeup
    // ------------------------------------------------------------------------

    /// Make `th` ready again: ready bit set, target and clock queues
    /// cleared, reverse lookup cleared, return slot = 0.
    pub(crate) fn wakeup(&mut self, wq: usize, th: ThreadId) {
        self.wakeup_return(wq, th, 0);
    }

    /// [`Kernel::wakeup`] delivering `ret` through the return-value slot.
    pub(crate) fn wakeup_return(&mut self, wq: usize, th: ThreadId, ret: u32) {
        self.wq[WQ_READY] |= th.bit();
        self.wq[wq] &= !th.bit();
        self.wq[WQ_CLOCK] &= !th.bit();
        self.stat_clr(th);
        self.retval_set(th, ret);
        trace!("wakeup {} from #{}", th, wq);
    }

    /// Wake the lowest-numbered waiter, if any.
    pub(crate) fn wake_one(&mut self, wq: usize) -> Option<ThreadId> {
        let th = self.wq_head(wq)?;
        self.wakeup(wq, th);
        Some(th)
    }

    /// Drain every waiter, lowest id first, delivering `ret` to each.
    /// Returns the number of threads released.
    pub(crate) fn wake_all(&mut self, wq: usize, ret: u32) -> u32 {
        let mut n = 0;
        while let Some(th) = self.wq_head(wq) {
            self.wakeup_return(wq, th, ret);
            n += 1;
        }
        n
    }

    /// Forcibly remove a thread from whatever queue the reverse lookup
    /// names. Used by cancellation and abort paths; exhaustive by
    /// construction because a thread is in at most one blocking queue.
    pub(crate) fn wq_unlink(&mut self, th: ThreadId) {
        let stat = self.stat[th.index()];
        if stat != 0 {
            let wq = (stat >> 1) as usize;
            self.wq[wq] &= !th.bit();
        }
        self.wq[WQ_CLOCK] &= !th.bit();
        self.stat_clr(th);
    }
}
