//! Gates
//!
//! A gate is a persistent open/closed boolean guarding entry. While the
//! gate is closed, entering threads queue; opening it releases every
//! queued thread. Closing only affects future entries - threads already
//! admitted are not expelled.

use log::trace;

use crate::kern::obj::ObjectKind;
use crate::kern::sched::Kernel;
use crate::types::{Error, ObjectId, Outcome, ThreadId, Ticks, TrapResult};

impl Kernel {
    /// Pass through the gate, blocking while it is closed.
    pub fn gate_enter(&mut self, th: ThreadId, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Gate)?;

        if self.gate_bits & (1 << idx) != 0 {
            return Ok(Outcome::Done(0));
        }
        self.wq_insert(oid.index(), th);
        self.retval_set(th, 0);
        self.defer_sched();
        trace!("{} blocked at {}", th, oid);
        Ok(Outcome::Blocked)
    }

    /// [`Kernel::gate_enter`] with a timeout.
    pub fn gate_enter_timed(&mut self, th: ThreadId, oid: ObjectId, ms: Ticks) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Gate)?;
        Self::check_timeout(ms)?;

        if self.gate_bits & (1 << idx) != 0 {
            return Ok(Outcome::Done(0));
        }
        self.wq_insert_timed(oid.index(), th, ms);
        self.retval_set(th, Error::Timeout.code() as u32);
        self.defer_sched();
        Ok(Outcome::Blocked)
    }

    /// Open the gate, releasing every queued thread.
    pub fn gate_open(&mut self, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Gate)?;
        self.gate_bits |= 1 << idx;
        if self.wake_all(oid.index(), 0) > 0 {
            self.preempt();
        }
        trace!("{} opened", oid);
        Ok(Outcome::Done(0))
    }

    /// Close the gate. Threads already past it are unaffected.
    pub fn gate_close(&mut self, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Gate)?;
        self.gate_bits &= !(1 << idx);
        Ok(Outcome::Done(0))
    }

    /// Whether the gate is open.
    pub fn gate_is_open(&self, oid: ObjectId) -> Result<bool, Error> {
        let idx = self.obj_check(oid, ObjectKind::Gate)?;
        Ok(self.gate_bits & (1 << idx) != 0)
    }
}
