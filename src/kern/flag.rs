//! Flags
//!
//! A flag is a single persistent signal bit. Signaling sets the bit and
//! releases every thread waiting for it; the bit stays set until cleared
//! explicitly, never implicitly on wake - which is what distinguishes a
//! flag from a semaphore.

use log::trace;

use crate::kern::obj::ObjectKind;
use crate::kern::sched::Kernel;
use crate::types::{Error, ObjectId, Outcome, ThreadId, Ticks, TrapResult};

impl Kernel {
    /// Wait until the flag is signaled. A flag already set completes
    /// immediately and is left set.
    pub fn flag_wait(&mut self, th: ThreadId, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Flag)?;

        if self.flag_bits & (1 << idx) != 0 {
            return Ok(Outcome::Done(0));
        }
        self.wq_insert(oid.index(), th);
        self.retval_set(th, 0);
        self.defer_sched();
        trace!("{} watches {}", th, oid);
        Ok(Outcome::Blocked)
    }

    /// [`Kernel::flag_wait`] with a timeout.
    pub fn flag_wait_timed(&mut self, th: ThreadId, oid: ObjectId, ms: Ticks) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Flag)?;
        Self::check_timeout(ms)?;

        if self.flag_bits & (1 << idx) != 0 {
            return Ok(Outcome::Done(0));
        }
        self.wq_insert_timed(oid.index(), th, ms);
        self.retval_set(th, Error::Timeout.code() as u32);
        self.defer_sched();
        Ok(Outcome::Blocked)
    }

    /// Set the flag and release every waiter.
    pub fn flag_signal(&mut self, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Flag)?;
        self.flag_bits |= 1 << idx;
        if self.wake_all(oid.index(), 0) > 0 {
            self.preempt();
        }
        Ok(Outcome::Done(0))
    }

    /// Clear the flag. Clearing is always explicit.
    pub fn flag_clear(&mut self, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Flag)?;
        self.flag_bits &= !(1 << idx);
        Ok(Outcome::Done(0))
    }

    /// Current value of the flag bit.
    pub fn flag_value(&self, oid: ObjectId) -> Result<bool, Error> {
        let idx = self.obj_check(oid, ObjectKind::Flag)?;
        Ok(self.flag_bits & (1 << idx) != 0)
    }
}
