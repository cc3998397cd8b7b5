//! Event sets
//!
//! An event set multiplexes up to 32 numbered events over one wait queue.
//! Raising an event marks it pending and hands it to the lowest-numbered
//! waiting thread, which receives the event number as its result; with no
//! waiter the pending bit holds the event. Masked events accumulate in the
//! pending bitmap without waking anyone until unmasked.

use log::trace;

use crate::config::EVENTS_PER_SET;
use crate::kern::obj::ObjectKind;
use crate::kern::sched::Kernel;
use crate::types::{Error, ObjectId, Outcome, ThreadId, Ticks, TrapResult};

/// Pending/mask bitmap pair of one event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSet {
    pub pend: u32,
    pub mask: u32,
}

impl EventSet {
    /// Fresh set: nothing pending, every event unmasked.
    pub const INIT: EventSet = EventSet {
        pend: 0,
        mask: u32::MAX,
    };
}

impl Kernel {
    /// Wait for any unmasked event; the lowest pending one is consumed and
    /// returned.
    pub fn ev_wait(&mut self, th: ThreadId, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Event)?;

        let armed = self.ev[idx].pend & self.ev[idx].mask;
        if armed != 0 {
            let ev = armed.trailing_zeros();
            self.ev[idx].pend &= !(1 << ev);
            return Ok(Outcome::Done(ev));
        }
        self.wq_insert(oid.index(), th);
        self.defer_sched();
        trace!("{} waits on {}", th, oid);
        Ok(Outcome::Blocked)
    }

    /// [`Kernel::ev_wait`] with a timeout.
    pub fn ev_wait_timed(&mut self, th: ThreadId, oid: ObjectId, ms: Ticks) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Event)?;
        Self::check_timeout(ms)?;

        let armed = self.ev[idx].pend & self.ev[idx].mask;
        if armed != 0 {
            let ev = armed.trailing_zeros();
            self.ev[idx].pend &= !(1 << ev);
            return Ok(Outcome::Done(ev));
        }
        self.wq_insert_timed(oid.index(), th, ms);
        self.retval_set(th, Error::Timeout.code() as u32);
        self.defer_sched();
        Ok(Outcome::Blocked)
    }

    /// Raise event `ev` on the set: deliver to a waiter or leave pending.
    pub fn ev_raise(&mut self, oid: ObjectId, ev: u32) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Event)?;
        if ev >= EVENTS_PER_SET {
            return Err(Error::InvalidArgument);
        }

        let unmasked = self.ev[idx].mask & (1 << ev) != 0;
        match self.wq_head(oid.index()) {
            Some(th) if unmasked => {
                self.wakeup_return(oid.index(), th, ev);
                self.preempt();
                trace!("event {}:{} delivered to {}", oid, ev, th);
            }
            _ => {
                self.ev[idx].pend |= 1 << ev;
            }
        }
        Ok(Outcome::Done(0))
    }

    /// Mask or unmask one event. Unmasking delivers a pending occurrence
    /// to a waiter right away.
    pub fn ev_mask(&mut self, oid: ObjectId, ev: u32, enabled: bool) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Event)?;
        if ev >= EVENTS_PER_SET {
            return Err(Error::InvalidArgument);
        }

        if enabled {
            self.ev[idx].mask |= 1 << ev;
            if self.ev[idx].pend & (1 << ev) != 0 {
                if let Some(th) = self.wq_head(oid.index()) {
                    self.ev[idx].pend &= !(1 << ev);
                    self.wakeup_return(oid.index(), th, ev);
                    self.preempt();
                }
            }
        } else {
            self.ev[idx].mask &= !(1 << ev);
        }
        Ok(Outcome::Done(0))
    }

    /// Drop a pending occurrence of `ev` without delivering it.
    pub fn ev_clear(&mut self, oid: ObjectId, ev: u32) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Event)?;
        if ev >= EVENTS_PER_SET {
            return Err(Error::InvalidArgument);
        }
        self.ev[idx].pend &= !(1 << ev);
        Ok(Outcome::Done(0))
    }

    /// Pending bitmap, for introspection and tests.
    pub fn ev_pending(&self, oid: ObjectId) -> Result<u32, Error> {
        let idx = self.obj_check(oid, ObjectKind::Event)?;
        Ok(self.ev[idx].pend)
    }
}
