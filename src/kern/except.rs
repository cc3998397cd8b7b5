//! Exception and fault capture
//!
//! On entry to a fault vector the handler freezes a snapshot of machine
//! and kernel state - the frame pushed by the hardware, the software-read
//! fault status/address registers, the active thread and the ready set -
//! into a single-slot buffer. What happens next is selected by
//! configuration, not by the fault: hand off to the debug monitor, abort
//! the faulting thread, or escalate to reset. A second fault arriving
//! while the first is unacknowledged is fatal, never merged.

use bitflags::bitflags;
use log::{error, warn};

use crate::config::FaultPolicy;
use crate::kern::sched::{Kernel, WQ_FAULT};
use crate::kern::thread::Context;
use crate::monitor::SigSet;
use crate::types::ThreadId;

/// Fault classes captured by the vector glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Unrecoverable escalated fault.
    Hard,
    /// Memory protection violation.
    Mem,
    /// Bus error on instruction or data access.
    Bus,
    /// Undefined instruction, invalid state, division by zero.
    Usage,
}

impl FaultKind {
    /// Fault name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            FaultKind::Hard => "hard fault",
            FaultKind::Mem => "mem fault",
            FaultKind::Bus => "bus fault",
            FaultKind::Usage => "usage fault",
        }
    }
}

bitflags! {
    /// Decoded fault status bits, normalized across fault classes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaultFlags: u32 {
        /// The fault address register holds a valid address.
        const ADDR_VALID    = 1 << 0;
        /// Instruction access violation.
        const IACC          = 1 << 1;
        /// Data access violation.
        const DACC          = 1 << 2;
        /// Undefined instruction.
        const UNDEF         = 1 << 3;
        /// Divide by zero.
        const DIV0          = 1 << 4;
        /// Unaligned access.
        const UNALIGNED     = 1 << 5;
        /// Stacking error during exception entry.
        const STACK         = 1 << 6;
        /// Escalated from a configurable-priority fault.
        const ESCALATED     = 1 << 7;
    }
}

/// Fault status/address registers read on fault entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStatus {
    pub flags: FaultFlags,
    /// Faulting address when `ADDR_VALID` is set.
    pub address: u32,
}

/// Frozen snapshot of machine and kernel state at fault entry.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionRecord {
    pub kind: FaultKind,
    /// Register frame of the faulting context.
    pub ctx: Context,
    /// Main and thread stack pointers at entry.
    pub sp_main: u32,
    pub sp_thread: u32,
    pub status: FaultStatus,
    /// Thread that was active, `None` if the fault hit idle/kernel code.
    pub thread: Option<ThreadId>,
    /// Ready-set bitmap at fault time.
    pub ready: u32,
    /// Tick count at fault time.
    pub at_tick: u32,
}

/// Single-slot exception buffer. One in-flight fault at a time; re-entry
/// while the slot is occupied marks the kernel state fatal.
pub struct ExceptSlot {
    record: Option<ExceptionRecord>,
    fatal: bool,
}

impl ExceptSlot {
    pub const fn new() -> Self {
        ExceptSlot {
            record: None,
            fatal: false,
        }
    }
}

/// Dispatch decision returned to the fault vector glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// The monitor was signaled; resume into the monitor context.
    MonitorNotified,
    /// The faulting thread was aborted; reschedule.
    ThreadKilled(ThreadId),
    /// Unrecoverable: the glue must reset the system.
    Reset,
}

impl Kernel {
    /// Capture a fault and dispatch it per policy.
    pub fn exception_enter(
        &mut self,
        kind: FaultKind,
        ctx: Context,
        sp_main: u32,
        sp_thread: u32,
        status: FaultStatus,
    ) -> FaultAction {
        if self.except.record.is_some() || self.except.fatal {
            // Double fault: the first record stays frozen for diagnosis.
            self.except.fatal = true;
            error!("double {} while record unacknowledged", kind.name());
            return FaultAction::Reset;
        }

        let thread = self.active;
        let record = ExceptionRecord {
            kind,
            ctx,
            sp_main,
            sp_thread,
            status,
            thread,
            ready: self.ready_set(),
            at_tick: self.ticks,
        };
        self.except.record = Some(record);
        warn!(
            "{} at pc={:08x} thread={:?}",
            kind.name(),
            ctx.pc,
            thread
        );

        match (self.cfg.fault_policy, thread) {
            (FaultPolicy::Reset, _) => FaultAction::Reset,
            (FaultPolicy::Monitor, Some(th)) => {
                // Park the thread on the fault queue; the monitor decides
                // whether to resume, kill or reset.
                self.suspend(th);
                self.wq[WQ_FAULT] |= th.bit();
                self.stat_set(th, WQ_FAULT, false);
                self.defer_sched();
                self.mon_signal(SigSet::THREAD_FAULT);
                FaultAction::MonitorNotified
            }
            (FaultPolicy::Monitor, None) => {
                self.mon_signal(SigSet::KRN_FAULT);
                FaultAction::MonitorNotified
            }
            (FaultPolicy::KillThread, Some(th)) => {
                self.thread_abort(th);
                FaultAction::ThreadKilled(th)
            }
            (FaultPolicy::KillThread, None) => {
                // No thread to kill: a fault in kernel or idle context is
                // beyond the policy and escalates.
                self.except.fatal = true;
                FaultAction::Reset
            }
        }
    }

    /// The frozen record, if a fault is in flight.
    pub fn exception_record(&self) -> Option<&ExceptionRecord> {
        self.except.record.as_ref()
    }

    /// Whether a re-entrant fault poisoned the kernel state.
    pub fn exception_is_fatal(&self) -> bool {
        self.except.fatal
    }

    /// Acknowledge and clear the in-flight record. Fatal state does not
    /// clear; only a reset leaves it.
    pub fn exception_ack(&mut self) -> Option<ExceptionRecord> {
        self.except.record.take()
    }
}
