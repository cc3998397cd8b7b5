//! Scheduler and the kernel context
//!
//! All mutable kernel state lives in the [`Kernel`] value defined here and
//! is passed by reference into every trap and interrupt handler; no other
//! module holds a long-lived reference. Mutation happens only at trap or
//! interrupt level, which never run concurrently with each other, so the
//! bitmaps need no finer-grained locking - correctness rests on every
//! operation completing before the next preemption point, which the
//! deferred-reschedule protocol guarantees.
//!
//! The scheduler itself is minimal: it picks the lowest-numbered thread in
//! the ready set. The time-share machinery rotates threads out of the ready
//! set when their credit underflows, so "lowest ready id" composes with the
//! priority-decay policy without a run queue per priority.

use log::trace;

use crate::config::{
    KernelConfig, EVENT_CAP, FLAG_CAP, GATE_CAP, IRQ_CAP, MUTEX_CAP, SCHED_LIMIT_MAX,
    SCHED_LIMIT_MIN, SEMAPHORE_CAP, THREADS_CAP,
};
use crate::kern::console::Console;
use crate::kern::event::EventSet;
use crate::kern::except::ExceptSlot;
use crate::kern::obj::ObjectMap;
use crate::kern::thread::{Context, ThreadSlot};
use crate::monitor::{MonitorLink, SigSet};
use crate::types::{ThreadId, Ticks};

// ============================================================================
// Reserved wait-queue indexes
// ============================================================================

/// Threads ready to run (the running thread keeps its bit set).
pub const WQ_READY: usize = 0;
/// Threads whose time-share credit ran out this cycle.
pub const WQ_TMSHARE: usize = 1;
/// Threads with an armed timeout deadline.
pub const WQ_CLOCK: usize = 2;
/// Paused threads.
pub const WQ_PAUSED: usize = 3;
/// Threads that exited with no joiner yet.
pub const WQ_CANCELED: usize = 4;
/// Threads blocked reading the console pipe.
pub const WQ_CONSOLE_RD: usize = 5;
/// Threads blocked writing the console pipe.
pub const WQ_CONSOLE_WR: usize = 6;
/// Threads blocked in `irq_wait`.
pub const WQ_IRQ: usize = 7;
/// Threads stopped by a fault (monitor fault policy).
pub const WQ_FAULT: usize = 8;
/// First index available to per-object ranges.
pub const WQ_FIXED: usize = 9;

/// Total wait-queue storage at hard caps.
pub const WQ_CAP: usize = WQ_FIXED
    + MUTEX_CAP
    + crate::config::COND_CAP
    + SEMAPHORE_CAP
    + EVENT_CAP
    + FLAG_CAP
    + GATE_CAP
    + THREADS_CAP;

// ============================================================================
// Kernel context
// ============================================================================

/// Scheduler statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedStats {
    /// Scheduling decisions that changed the active thread.
    pub context_switches: u32,
    /// Clock interrupts observed.
    pub ticks: u32,
    /// Scheduling decisions that selected idle.
    pub idle_picks: u32,
}

/// The whole of the kernel's mutable state.
pub struct Kernel {
    pub(crate) cfg: KernelConfig,
    pub(crate) map: ObjectMap,

    // Thread table
    pub(crate) threads: [ThreadSlot; THREADS_CAP],
    pub(crate) th_alloc: u32,
    /// Reverse lookup per thread: `(wait queue << 1) | clocked`, 0 = none.
    pub(crate) stat: [u16; THREADS_CAP],
    pub(crate) active: Option<ThreadId>,

    // Wait-queue bitmaps, indexed by object/queue id
    pub(crate) wq: [u32; WQ_CAP],

    // Time-share state
    pub(crate) sched_val: [i8; THREADS_CAP],
    pub(crate) sched_pri: [u8; THREADS_CAP],
    pub(crate) sched_limit: u8,

    // Clock
    pub(crate) ticks: Ticks,
    pub(crate) clock: [Ticks; THREADS_CAP],

    // Deferred reschedule and critical sections
    pub(crate) resched: bool,
    pub(crate) critical_cnt: u32,

    // Object state beyond the wait queues
    pub(crate) mutex_owner: [Option<ThreadId>; MUTEX_CAP],
    /// Mutex paired with each thread's in-progress condition wait.
    pub(crate) cond_pair: [Option<crate::types::ObjectId>; THREADS_CAP],
    pub(crate) sem_val: [u32; SEMAPHORE_CAP],
    pub(crate) ev: [EventSet; EVENT_CAP],
    /// One signal bit per flag object; cleared only explicitly.
    pub(crate) flag_bits: u32,
    /// One open bit per gate object.
    pub(crate) gate_bits: u16,

    // Allocation bitmaps
    pub(crate) mutex_alloc: u32,
    pub(crate) sem_alloc: u32,
    pub(crate) cond_alloc: u32,
    pub(crate) ev_alloc: u32,
    pub(crate) flag_alloc: u32,
    pub(crate) gate_alloc: u32,

    // IRQ-wait bridge: the thread bound to each line
    pub(crate) irq_thread: [Option<ThreadId>; IRQ_CAP],

    // Fault capture (single slot)
    pub(crate) except: ExceptSlot,

    // Exit continuation address installed by the port
    pub(crate) exit_veneer: u32,

    // Debug monitor signal link and console pipes
    pub(crate) mon: MonitorLink,
    pub(crate) console: Console,

    pub(crate) stats: SchedStats,
}

impl Kernel {
    /// Build the kernel context from a validated configuration.
    pub fn new(cfg: KernelConfig) -> Self {
        let map = ObjectMap::new(&cfg);
        let mut kern = Kernel {
            cfg,
            map,
            threads: [ThreadSlot::EMPTY; THREADS_CAP],
            th_alloc: 0,
            stat: [0; THREADS_CAP],
            active: None,
            wq: [0; WQ_CAP],
            sched_val: [0; THREADS_CAP],
            sched_pri: [0; THREADS_CAP],
            sched_limit: SCHED_LIMIT_MIN,
            ticks: 0,
            clock: [0; THREADS_CAP],
            resched: false,
            critical_cnt: 0,
            mutex_owner: [None; MUTEX_CAP],
            cond_pair: [None; THREADS_CAP],
            sem_val: [0; SEMAPHORE_CAP],
            ev: [EventSet::INIT; EVENT_CAP],
            flag_bits: 0,
            gate_bits: 0,
            mutex_alloc: 0,
            sem_alloc: 0,
            cond_alloc: 0,
            ev_alloc: 0,
            flag_alloc: 0,
            gate_alloc: 0,
            irq_thread: [None; IRQ_CAP],
            except: ExceptSlot::new(),
            exit_veneer: EXIT_VENEER_NONE,
            mon: MonitorLink::new(),
            console: Console::new(),
            stats: SchedStats::default(),
        };
        kern.mon.events = SigSet::STARTUP;
        kern
    }

    /// Install the address threads return into when their entry function
    /// falls off the end (the exit continuation stub). Set by the port at
    /// boot.
    pub fn set_exit_veneer(&mut self, addr: u32) {
        self.exit_veneer = addr;
    }

    pub fn config(&self) -> &KernelConfig {
        &self.cfg
    }

    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    // ------------------------------------------------------------------------
    // Deferred reschedule
    // ------------------------------------------------------------------------

    /// Flag a deferred execution of the scheduler. The context swap happens
    /// only at the next trap/interrupt return, never mid-handler.
    #[inline]
    pub(crate) fn defer_sched(&mut self) {
        self.resched = true;
    }

    /// Flag a reschedule unless preemption is held off by a critical
    /// section.
    #[inline]
    pub(crate) fn preempt(&mut self) {
        if self.critical_cnt == 0 {
            self.resched = true;
        }
    }

    /// Consume the pending-reschedule flag.
    pub fn take_resched_pending(&mut self) -> bool {
        core::mem::take(&mut self.resched)
    }

    /// Whether a reschedule is pending (introspection only).
    pub fn resched_pending(&self) -> bool {
        self.resched
    }

    /// Enter a preemption-free critical section (nestable).
    pub fn critical_enter(&mut self) {
        self.critical_cnt += 1;
    }

    /// Leave a critical section; a reschedule suppressed inside becomes
    /// pending on the final exit.
    pub fn critical_exit(&mut self) {
        if self.critical_cnt > 0 {
            self.critical_cnt -= 1;
        }
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Pick the next thread to run: the lowest-numbered id in the ready
    /// set, or `None` for idle. Clears the pending-reschedule flag; the
    /// caller is the context-swap reentry point.
    pub fn schedule(&mut self) -> Option<ThreadId> {
        self.resched = false;
        let ready = self.wq[WQ_READY];
        let next = if ready == 0 {
            self.stats.idle_picks += 1;
            // Idle indication is delivered only when the monitor asked.
            if self.mon.mask.contains(SigSet::IDLE) {
                self.mon.events |= SigSet::IDLE;
            }
            None
        } else {
            Some(ThreadId(ready.trailing_zeros() as u8))
        };
        if next != self.active {
            self.stats.context_switches += 1;
            trace!("switch {:?} -> {:?}", self.active, next);
        }
        self.active = next;
        next
    }

    /// Currently active thread (`None` while idle).
    pub fn active_thread(&self) -> Option<ThreadId> {
        self.active
    }

    /// Whether a thread is in the ready set (running threads stay ready).
    pub fn is_ready(&self, th: ThreadId) -> bool {
        self.wq[WQ_READY] & th.bit() != 0
    }

    /// Snapshot of the ready set bitmap.
    pub fn ready_set(&self) -> u32 {
        self.wq[WQ_READY]
    }

    /// Remove a thread from the ready set. When the ready set drains, the
    /// time-share queue folds back in so exhausted threads resume rotating.
    pub(crate) fn suspend(&mut self, th: ThreadId) {
        let mut ready = self.wq[WQ_READY] & !th.bit();
        if self.cfg.timeshare && ready == 0 {
            ready |= self.wq[WQ_TMSHARE];
            self.wq[WQ_TMSHARE] = 0;
        }
        self.wq[WQ_READY] = ready;
    }

    // ------------------------------------------------------------------------
    // Time-share policy
    // ------------------------------------------------------------------------

    /// Charge the active thread one tick of credit. On underflow the
    /// credit is topped up by the schedule limit and the thread rotates to
    /// the time-share queue, yielding to lower-id peers until the ready
    /// set drains.
    pub(crate) fn timeshare_tick(&mut self) {
        let th = match self.active {
            Some(th) => th,
            None => return,
        };
        let i = th.index();
        self.sched_val[i] -= self.sched_pri[i] as i8;
        if self.sched_val[i] < 0 {
            self.sched_val[i] += self.sched_limit as i8;
            if self.wq[WQ_READY] & th.bit() != 0 {
                self.wq[WQ_TMSHARE] |= th.bit();
                self.suspend(th);
                self.preempt();
            }
        }
    }

    /// Register a thread's time-share weight and seed its credit.
    pub(crate) fn timeshare_enroll(&mut self, th: ThreadId, weight: u8) {
        let w = weight.clamp(SCHED_LIMIT_MIN, SCHED_LIMIT_MAX);
        self.sched_pri[th.index()] = w;
        if self.sched_limit < w {
            self.sched_limit = w;
        }
        self.sched_val[th.index()] = (self.sched_limit / 2) as i8;
    }

    /// Re-evaluate the schedule limit after a thread leaves: the maximum
    /// weight among live threads, floored at the minimum.
    pub(crate) fn timeshare_rebalance(&mut self, leaving: ThreadId) {
        self.sched_pri[leaving.index()] = 0;
        let mut limit = SCHED_LIMIT_MIN;
        let mut alive = self.th_alloc & !leaving.bit();
        while alive != 0 {
            let i = alive.trailing_zeros() as usize;
            alive &= alive - 1;
            if self.sched_pri[i] > limit {
                limit = self.sched_pri[i];
            }
        }
        self.sched_limit = limit;
    }

    // ------------------------------------------------------------------------
    // Return-value channel
    // ------------------------------------------------------------------------

    /// Write a thread's saved return-value slot (`r0`).
    pub(crate) fn retval_set(&mut self, th: ThreadId, val: u32) {
        if let Some(ctx) = self.threads[th.index()].ctx.as_mut() {
            ctx.r0 = val;
        }
    }

    /// Read a thread's saved return-value slot as the signed syscall code.
    pub fn thread_retval(&self, th: ThreadId) -> i32 {
        self.threads[th.index()]
            .ctx
            .as_ref()
            .map(|c| c.r0 as i32)
            .unwrap_or(0)
    }

    /// Borrow a thread's saved context, if the thread is alive.
    pub fn thread_ctx(&self, th: ThreadId) -> Option<&Context> {
        self.threads[th.index()].ctx.as_ref()
    }

    // ------------------------------------------------------------------------
    // Monitor link
    // ------------------------------------------------------------------------

    /// Raise debug-monitor signals.
    pub(crate) fn mon_signal(&mut self, sig: SigSet) {
        self.mon.events |= sig;
    }

    /// The monitor session's view of its pending signals.
    pub fn mon_link(&mut self) -> &mut MonitorLink {
        &mut self.mon
    }
}

/// Sentinel before the port installs a real exit continuation address.
pub const EXIT_VENEER_NONE: u32 = 0xffff_fffe;
