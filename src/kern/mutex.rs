//! Mutexes
//!
//! A mutex is its wait queue plus an owner thread id. Unlock transfers
//! ownership directly to the lowest-numbered waiter, so there is no window
//! in which a third thread can steal the lock between wake and re-acquire.
//! Unlock by a non-owner is a reported error, never silently ignored.

use log::trace;

use crate::kern::obj::ObjectKind;
use crate::kern::sched::Kernel;
use crate::types::{Error, ObjectId, Outcome, ThreadId, Ticks, TrapResult};

impl Kernel {
    /// Acquire the mutex, blocking while another thread owns it.
    pub fn mutex_lock(&mut self, th: ThreadId, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Mutex)?;

        match self.mutex_owner[idx] {
            None => {
                self.mutex_owner[idx] = Some(th);
                trace!("{} locked {}", th, oid);
                Ok(Outcome::Done(0))
            }
            Some(owner) if owner == th => {
                if self.cfg.deadlock_check {
                    Err(Error::Deadlock)
                } else {
                    // Without the check a self-lock blocks forever; still
                    // park the thread so the state stays consistent.
                    self.wq_insert(oid.index(), th);
                    self.defer_sched();
                    Ok(Outcome::Blocked)
                }
            }
            Some(_) => {
                self.wq_insert(oid.index(), th);
                self.retval_set(th, 0);
                self.defer_sched();
                trace!("{} waits on {}", th, oid);
                Ok(Outcome::Blocked)
            }
        }
    }

    /// Acquire the mutex without blocking.
    pub fn mutex_try_lock(&mut self, th: ThreadId, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Mutex)?;
        match self.mutex_owner[idx] {
            None => {
                self.mutex_owner[idx] = Some(th);
                Ok(Outcome::Done(0))
            }
            Some(owner) if owner == th && self.cfg.deadlock_check => Err(Error::Deadlock),
            Some(_) => Err(Error::Again),
        }
    }

    /// Acquire the mutex or give up after `ms` ticks.
    pub fn mutex_lock_timed(&mut self, th: ThreadId, oid: ObjectId, ms: Ticks) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Mutex)?;
        Self::check_timeout(ms)?;

        match self.mutex_owner[idx] {
            None => {
                self.mutex_owner[idx] = Some(th);
                Ok(Outcome::Done(0))
            }
            Some(owner) if owner == th && self.cfg.deadlock_check => Err(Error::Deadlock),
            Some(_) => {
                self.wq_insert_timed(oid.index(), th, ms);
                // Default result is the timeout; a handover rewrites it.
                self.retval_set(th, Error::Timeout.code() as u32);
                self.defer_sched();
                Ok(Outcome::Blocked)
            }
        }
    }

    /// Release the mutex, handing it to the next waiter if any.
    pub fn mutex_unlock(&mut self, th: ThreadId, oid: ObjectId) -> TrapResult {
        let idx = self.obj_check(oid, ObjectKind::Mutex)?;

        if self.mutex_owner[idx] != Some(th) {
            return Err(Error::NotOwner);
        }
        self.mutex_transfer(idx, oid.index());
        trace!("{} unlocked {}", th, oid);
        Ok(Outcome::Done(0))
    }

    /// Current owner of a mutex, for introspection and tests.
    pub fn mutex_owner_of(&self, oid: ObjectId) -> Result<Option<ThreadId>, Error> {
        let idx = self.obj_check(oid, ObjectKind::Mutex)?;
        Ok(self.mutex_owner[idx])
    }

    /// Give the mutex to the lowest-numbered waiter, or mark it free.
    pub(crate) fn mutex_transfer(&mut self, idx: usize, wq: usize) {
        match self.wq_head(wq) {
            Some(next) => {
                self.mutex_owner[idx] = Some(next);
                self.wakeup(wq, next);
                self.defer_sched();
            }
            None => {
                self.mutex_owner[idx] = None;
            }
        }
    }

    /// Release every mutex `th` owns (abort path). Waiters receive the
    /// lock as usual so no ownership dangles.
    pub(crate) fn mutex_abandon_all(&mut self, th: ThreadId) {
        for idx in 0..self.cfg.mutexes {
            if self.mutex_owner[idx] == Some(th) {
                let wq = self.map.mutex_base + idx;
                self.mutex_transfer(idx, wq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kern::thread::ThreadInit;

    fn kernel_with(ids: &[u8]) -> Kernel {
        let mut k = Kernel::new(KernelConfig::default());
        for &id in ids {
            k.thread_create(
                ThreadInit::new(0x0800_0000, 0, 0x2000_0000 + id as u32 * 0x400, 512).with_id(id),
            )
            .unwrap();
        }
        k
    }

    #[test]
    fn lock_unlock_round_trip() {
        let mut k = kernel_with(&[0, 1]);
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();

        assert_eq!(k.mutex_lock(ThreadId(0), m), Ok(Outcome::Done(0)));
        assert_eq!(k.mutex_owner_of(m).unwrap(), Some(ThreadId(0)));
        assert_eq!(k.mutex_unlock(ThreadId(0), m), Ok(Outcome::Done(0)));
        assert_eq!(k.mutex_owner_of(m).unwrap(), None);
    }

    #[test]
    fn unlock_by_non_owner_is_reported_and_changes_nothing() {
        let mut k = kernel_with(&[0, 1]);
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();
        k.mutex_lock(ThreadId(0), m).unwrap();

        assert_eq!(k.mutex_unlock(ThreadId(1), m), Err(Error::NotOwner));
        assert_eq!(k.mutex_owner_of(m).unwrap(), Some(ThreadId(0)));

        // Unlocking an unowned mutex is a NotOwner error too.
        k.mutex_unlock(ThreadId(0), m).unwrap();
        assert_eq!(k.mutex_unlock(ThreadId(0), m), Err(Error::NotOwner));
    }

    #[test]
    fn unlock_hands_ownership_to_lowest_waiter() {
        let mut k = kernel_with(&[0, 2, 5]);
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();
        k.mutex_lock(ThreadId(0), m).unwrap();

        assert_eq!(k.mutex_lock(ThreadId(5), m), Ok(Outcome::Blocked));
        assert_eq!(k.mutex_lock(ThreadId(2), m), Ok(Outcome::Blocked));

        k.mutex_unlock(ThreadId(0), m).unwrap();
        // Direct transfer: the lowest-numbered waiter owns the lock already.
        assert_eq!(k.mutex_owner_of(m).unwrap(), Some(ThreadId(2)));
        assert!(k.is_ready(ThreadId(2)));
        assert!(!k.is_ready(ThreadId(5)));
        assert_eq!(k.thread_retval(ThreadId(2)), 0);
    }

    #[test]
    fn relock_is_deadlock_when_checked() {
        let mut k = kernel_with(&[0]);
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();
        k.mutex_lock(ThreadId(0), m).unwrap();
        assert_eq!(k.mutex_lock(ThreadId(0), m), Err(Error::Deadlock));
        assert_eq!(k.mutex_try_lock(ThreadId(0), m), Err(Error::Deadlock));
    }

    #[test]
    fn try_lock_never_blocks() {
        let mut k = kernel_with(&[0, 1]);
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();
        k.mutex_lock(ThreadId(0), m).unwrap();
        assert_eq!(k.mutex_try_lock(ThreadId(1), m), Err(Error::Again));
        assert!(k.is_ready(ThreadId(1)));
    }

    #[test]
    fn timed_lock_times_out_with_owner_intact() {
        let mut k = kernel_with(&[0, 1]);
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();
        k.mutex_lock(ThreadId(0), m).unwrap();

        assert_eq!(k.mutex_lock_timed(ThreadId(1), m, 2), Ok(Outcome::Blocked));
        k.clock_tick();
        k.clock_tick();
        assert!(k.is_ready(ThreadId(1)));
        assert_eq!(k.thread_retval(ThreadId(1)), Error::Timeout.code());
        assert_eq!(k.mutex_owner_of(m).unwrap(), Some(ThreadId(0)));
        assert_eq!(k.wq_count(m.index()), 0);
    }

    #[test]
    fn timed_lock_handover_beats_the_clock() {
        let mut k = kernel_with(&[0, 1]);
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();
        k.mutex_lock(ThreadId(0), m).unwrap();
        k.mutex_lock_timed(ThreadId(1), m, 10).unwrap();

        k.clock_tick();
        k.mutex_unlock(ThreadId(0), m).unwrap();
        assert_eq!(k.mutex_owner_of(m).unwrap(), Some(ThreadId(1)));
        assert_eq!(k.thread_retval(ThreadId(1)), 0);
    }

    // Scenario: three equal-weight threads each run 100 lock/compute/unlock
    // cycles against one mutex; the test plays the part of the CPU, running
    // whichever thread the scheduler picks and letting the clock rotate
    // them. Expected: 300 critical-section entries, never two at once.
    #[test]
    fn mutual_exclusion_scenario() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut k = kernel_with(&[0, 1, 2]);
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();

        let mut cycles = [0u32; 3];
        let mut holding = [false; 3];
        let mut pending = [false; 3];
        let mut entries = 0u32;
        let mut steps = 0u32;

        while entries < 300 || holding.iter().any(|&h| h) {
            steps += 1;
            assert!(steps < 100_000, "scenario failed to converge");

            k.clock_tick();
            let th = match k.schedule() {
                Some(th) => th,
                None => continue,
            };
            let i = th.index();

            if pending[i] {
                // Woken by the unlock handover: the lock is already ours.
                assert_eq!(k.mutex_owner_of(m).unwrap(), Some(th));
                assert_eq!(k.thread_retval(th), 0);
                pending[i] = false;
                holding[i] = true;
                entries += 1;
                assert_eq!(holding.iter().filter(|&&h| h).count(), 1);
            } else if holding[i] {
                k.mutex_unlock(th, m).unwrap();
                holding[i] = false;
                cycles[i] += 1;
            } else if cycles[i] < 100 {
                match k.mutex_lock(th, m).unwrap() {
                    Outcome::Done(0) => {
                        holding[i] = true;
                        entries += 1;
                        assert_eq!(holding.iter().filter(|&&h| h).count(), 1);
                    }
                    Outcome::Blocked => pending[i] = true,
                    Outcome::Done(_) => unreachable!(),
                }
            } else {
                // This thread finished its 100 cycles; park it.
                k.thread_pause(th).unwrap();
            }
        }

        assert_eq!(entries, 300);
        assert_eq!(cycles, [100, 100, 100]);
        assert_eq!(k.mutex_owner_of(m).unwrap(), None);
        assert_eq!(k.wq_count(m.index()), 0);
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let mut k = kernel_with(&[0]);
        // Reserved queue ids are not mutexes.
        assert_eq!(
            k.mutex_lock(ThreadId(0), ObjectId(0)),
            Err(Error::InvalidObjectId)
        );
        // In-range but unallocated.
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();
        k.obj_free(m).unwrap();
        assert_eq!(k.mutex_lock(ThreadId(0), m), Err(Error::InvalidObjectId));
    }
}
