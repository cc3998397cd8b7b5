//! Clock and timeout subsystem
//!
//! A monotonically increasing tick counter feeds the clock wait queue.
//! Each tick scans the queue and wakes every thread whose deadline has
//! passed; the wake removes the thread from both the clock queue and its
//! target queue, so a timed wait resolves exactly once. Deadlines compare
//! with wrapping arithmetic, so the counter rolling over is harmless.

use log::trace;

use crate::kern::sched::{Kernel, WQ_CLOCK};
use crate::monitor::SigSet;
use crate::types::{Error, Outcome, ThreadId, Ticks, TrapResult};

impl Kernel {
    /// Current tick count.
    pub fn ticks(&self) -> Ticks {
        self.ticks
    }

    /// Clock interrupt handler: advance time, expire deadlines, drive the
    /// monitor alarm and charge the time-share credit.
    pub fn clock_tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        self.stats.ticks += 1;
        let now = self.ticks;

        let mut pending = self.wq[WQ_CLOCK];
        while pending != 0 {
            let i = pending.trailing_zeros() as usize;
            pending &= pending - 1;
            if (self.clock[i].wrapping_sub(now) as i32) <= 0 {
                self.time_wakeup(ThreadId(i as u8));
            }
        }

        if let Some(deadline) = self.mon.alarm {
            if (deadline.wrapping_sub(now) as i32) <= 0 {
                self.mon.alarm = None;
                self.mon_signal(SigSet::ALARM);
            }
        }

        if self.cfg.timeshare {
            self.timeshare_tick();
        }
    }

    /// Expire one thread's deadline: remove it from its wait queue and the
    /// clock queue, make it ready. The return slot keeps the default the
    /// blocking call installed (`Timeout` for timed waits, 0 for sleep).
    fn time_wakeup(&mut self, th: ThreadId) {
        if let Some(wq) = self.thread_wait_queue(th) {
            self.wq[wq] &= !th.bit();
        }
        self.stat_clr(th);
        self.wq[WQ_CLOCK] &= !th.bit();
        self.wq[crate::kern::sched::WQ_READY] |= th.bit();
        trace!("deadline wakeup {}", th);
        self.preempt();
    }

    /// Sleep for `ms` ticks.
    pub fn sleep(&mut self, th: ThreadId, ms: Ticks) -> TrapResult {
        if ms == 0 {
            return Ok(Outcome::Done(0));
        }
        self.suspend(th);
        self.clock[th.index()] = self.ticks.wrapping_add(ms);
        self.wq[WQ_CLOCK] |= th.bit();
        self.stat_set(th, WQ_CLOCK, true);
        self.retval_set(th, 0);
        self.defer_sched();
        Ok(Outcome::Blocked)
    }

    /// Sleep until the absolute tick `deadline`. A deadline already in the
    /// past completes immediately.
    pub fn alarm(&mut self, th: ThreadId, deadline: Ticks) -> TrapResult {
        if (deadline.wrapping_sub(self.ticks) as i32) <= 0 {
            return Ok(Outcome::Done(0));
        }
        self.suspend(th);
        self.clock[th.index()] = deadline;
        self.wq[WQ_CLOCK] |= th.bit();
        self.stat_set(th, WQ_CLOCK, true);
        self.retval_set(th, 0);
        self.defer_sched();
        Ok(Outcome::Blocked)
    }

    /// Arm the monitor alarm `ms` ticks from now (one deadline, re-armed
    /// by the monitor itself).
    pub fn mon_alarm_set(&mut self, ms: Ticks) {
        self.mon.alarm = Some(self.ticks.wrapping_add(ms));
    }

    /// Disarm the monitor alarm.
    pub fn mon_alarm_stop(&mut self) {
        self.mon.alarm = None;
    }

    /// Validate a timeout argument for timed waits.
    pub(crate) fn check_timeout(ms: Ticks) -> Result<(), Error> {
        if ms == 0 {
            Err(Error::InvalidArgument)
        } else {
            Ok(())
        }
    }
}
