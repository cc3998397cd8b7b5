//! Interrupt-wait bridge
//!
//! At most one thread is bound to each interrupt line. `irq_wait` clears
//! any stale pending state, parks the caller and enables the source; the
//! interrupt handler disables the source again, wakes the bound thread and
//! requests a deferred reschedule. Each wait therefore consumes exactly
//! one enablement, so a line can never storm while no thread is ready to
//! service it. Lines on the force-enabled list are never masked by kernel
//! operations.

use log::{trace, warn};

use crate::board::IrqControl;
use crate::kern::sched::{Kernel, WQ_IRQ};
use crate::types::{Error, IrqId, Outcome, ThreadId, Ticks, TrapResult};

/// Default priority for lines reset by [`Kernel::irq_reset_all`].
pub const IRQ_DEF_PRIORITY: u8 = 0x80;

impl Kernel {
    fn irq_check(&self, irq: IrqId) -> Result<usize, Error> {
        if irq.index() >= self.cfg.irqs {
            return Err(Error::InvalidArgument);
        }
        Ok(irq.index())
    }

    /// Block until `irq` fires once.
    ///
    /// Pending state is cleared first, so a previous occurrence can not
    /// satisfy this wait spuriously; the source is enabled on the way out.
    pub fn irq_wait(&mut self, th: ThreadId, irq: IrqId, ctl: &mut dyn IrqControl) -> TrapResult {
        let idx = self.irq_check(irq)?;
        if let Some(prev) = self.irq_thread[idx] {
            warn!("irq {} already bound to {}", irq.index(), prev);
            return Err(Error::Again);
        }

        ctl.clear_pending(irq);
        self.wq_insert(WQ_IRQ, th);
        self.retval_set(th, 0);
        self.irq_thread[idx] = Some(th);
        self.defer_sched();
        ctl.enable(irq);
        trace!("{} waits for irq {}", th, irq.index());
        Ok(Outcome::Blocked)
    }

    /// [`Kernel::irq_wait`] bounded by `ms` ticks. On expiry the line is
    /// masked again and the binding dissolved.
    pub fn irq_wait_timed(
        &mut self,
        th: ThreadId,
        irq: IrqId,
        ms: Ticks,
        ctl: &mut dyn IrqControl,
    ) -> TrapResult {
        let idx = self.irq_check(irq)?;
        Self::check_timeout(ms)?;
        if self.irq_thread[idx].is_some() {
            return Err(Error::Again);
        }

        ctl.clear_pending(irq);
        self.wq_insert_timed(WQ_IRQ, th, ms);
        self.retval_set(th, Error::Timeout.code() as u32);
        self.irq_thread[idx] = Some(th);
        self.defer_sched();
        ctl.enable(irq);
        Ok(Outcome::Blocked)
    }

    /// Cleanup after a timed wait returned `Timeout`: mask the source and
    /// clear a binding the interrupt never consumed.
    pub fn irq_wait_cleanup(&mut self, irq: IrqId, ctl: &mut dyn IrqControl) -> TrapResult {
        let idx = self.irq_check(irq)?;
        if self.cfg.irq_maskable(irq) {
            ctl.disable(irq);
        }
        match self.irq_thread[idx].take() {
            Some(_) => Ok(Outcome::Done(Error::Timeout.code() as u32)),
            None => Ok(Outcome::Done(0)),
        }
    }

    /// Interrupt-handler half of the bridge: mask the source, wake the
    /// bound thread, request the deferred reschedule.
    pub fn irq_raise(&mut self, irq: IrqId, ctl: &mut dyn IrqControl) {
        let idx = match self.irq_check(irq) {
            Ok(i) => i,
            Err(_) => return,
        };
        if self.cfg.irq_maskable(irq) {
            ctl.disable(irq);
        }
        if let Some(th) = self.irq_thread[idx].take() {
            self.wakeup(WQ_IRQ, th);
            self.preempt();
            trace!("irq {} wakes {}", irq.index(), th);
        }
    }

    /// Thread currently bound to a line, for introspection.
    pub fn irq_bound_thread(&self, irq: IrqId) -> Option<ThreadId> {
        self.irq_thread.get(irq.index()).copied().flatten()
    }

    /// Reset every bridged line to its boot state: default priority,
    /// masked unless force-enabled, no binding.
    pub fn irq_reset_all(&mut self, ctl: &mut dyn IrqControl) {
        for i in 0..self.cfg.irqs {
            let irq = IrqId(i as u8);
            ctl.set_priority(irq, IRQ_DEF_PRIORITY);
            if self.cfg.irq_maskable(irq) {
                ctl.disable(irq);
            } else {
                ctl.enable(irq);
            }
            self.irq_thread[i] = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::mock::MockIrqCtl;
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
    fn wait_binds_enables_and_blocks() {
        let mut k = kernel_with(&[0]);
        let mut ctl = MockIrqCtl::default();
        let irq = IrqId(5);

        assert_eq!(k.irq_wait(ThreadId(0), irq, &mut ctl), Ok(Outcome::Blocked));
        assert_eq!(k.irq_bound_thread(irq), Some(ThreadId(0)));
        assert!(!k.is_ready(ThreadId(0)));
        assert_ne!(ctl.enabled & (1 << 5), 0);
    }

    #[test]
    fn raise_wakes_and_masks_exactly_once() {
        let mut k = kernel_with(&[0]);
        let mut ctl = MockIrqCtl::default();
        let irq = IrqId(5);
        k.irq_wait(ThreadId(0), irq, &mut ctl).unwrap();

        k.irq_raise(irq, &mut ctl);
        assert!(k.is_ready(ThreadId(0)));
        assert_eq!(k.irq_bound_thread(irq), None);
        assert_eq!(ctl.enabled & (1 << 5), 0);
        assert_eq!(ctl.enables, 1);
        assert_eq!(ctl.disables, 1);
    }

    // Scenario: irq_wait twice in a row with no interrupt in between; the
    // second call must block until the interrupt actually fires again.
    #[test]
    fn no_spurious_wake_across_waits() {
        let mut k = kernel_with(&[0]);
        let mut ctl = MockIrqCtl::default();
        let irq = IrqId(5);

        k.irq_wait(ThreadId(0), irq, &mut ctl).unwrap();
        k.irq_raise(irq, &mut ctl);
        assert!(k.is_ready(ThreadId(0)));

        // Second wait: still blocked, nothing pending carries over.
        assert_eq!(k.irq_wait(ThreadId(0), irq, &mut ctl), Ok(Outcome::Blocked));
        assert!(!k.is_ready(ThreadId(0)));

        k.irq_raise(irq, &mut ctl);
        assert!(k.is_ready(ThreadId(0)));
        assert_eq!(ctl.enables, 2);
    }

    #[test]
    fn second_binding_is_refused() {
        let mut k = kernel_with(&[0, 1]);
        let mut ctl = MockIrqCtl::default();
        let irq = IrqId(3);
        k.irq_wait(ThreadId(0), irq, &mut ctl).unwrap();
        assert_eq!(k.irq_wait(ThreadId(1), irq, &mut ctl), Err(Error::Again));
    }

    #[test]
    fn timed_wait_expiry_then_cleanup() {
        let mut k = kernel_with(&[0]);
        let mut ctl = MockIrqCtl::default();
        let irq = IrqId(7);

        k.irq_wait_timed(ThreadId(0), irq, 2, &mut ctl).unwrap();
        k.clock_tick();
        k.clock_tick();
        assert!(k.is_ready(ThreadId(0)));
        assert_eq!(k.thread_retval(ThreadId(0)), Error::Timeout.code());

        // The binding is still armed; cleanup dissolves it and masks.
        assert_eq!(k.irq_bound_thread(irq), Some(ThreadId(0)));
        k.irq_wait_cleanup(irq, &mut ctl).unwrap();
        assert_eq!(k.irq_bound_thread(irq), None);
        assert_eq!(ctl.enabled & (1 << 7), 0);
    }

    #[test]
    fn force_enabled_lines_survive_reset_and_raise() {
        let cfg = KernelConfig {
            irq_force_enable: 1 << 2,
            ..Default::default()
        };
        let mut k = Kernel::new(cfg);
        k.thread_create(ThreadInit::new(0x0800_0000, 0, 0x2000_0000, 512).with_id(0))
            .unwrap();
        let mut ctl = MockIrqCtl::default();

        k.irq_reset_all(&mut ctl);
        assert_ne!(ctl.enabled & (1 << 2), 0);

        k.irq_wait(ThreadId(0), IrqId(2), &mut ctl).unwrap();
        k.irq_raise(IrqId(2), &mut ctl);
        // The raise woke the thread but did not mask the forced line.
        assert!(k.is_ready(ThreadId(0)));
        assert_ne!(ctl.enabled & (1 << 2), 0);
    }

    #[test]
    fn out_of_range_line_rejected() {
        let mut k = kernel_with(&[0]);
        let mut ctl = MockIrqCtl::default();
        assert_eq!(
            k.irq_wait(ThreadId(0), IrqId(63), &mut ctl),
            Err(Error::InvalidArgument)
        );
    }
}
