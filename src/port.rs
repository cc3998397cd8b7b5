//! Platform abstraction boundary
//!
//! Everything the kernel core needs from the target CPU is collected in one
//! trait, implemented once per target; the core above this line is
//! target-independent. A Cortex-M port maps `request_resched` to pending
//! the PendSV-equivalent service interrupt, the critical section to
//! interrupt masking, and `fault_status` to the fault status/address
//! registers read on fault entry.

use crate::kern::except::FaultStatus;

/// Target CPU services consumed by the boot glue and trap dispatch.
///
/// The kernel core itself only records a pending-reschedule flag; the trap
/// and interrupt return paths consult it and invoke [`CpuPort::request_resched`]
/// so the context swap happens at a defined reentry point, never mid-trap.
pub trait CpuPort: Sync {
    /// Mask preemption sources. Calls may not nest.
    fn enter_critical(&self);

    /// Restore preemption sources.
    fn exit_critical(&self);

    /// Trigger the deferred context switch at the next reentry point.
    fn request_resched(&self);

    /// Park the CPU until the next interrupt (idle loop body).
    fn idle_wait(&self);

    /// Read the fault status and fault address captured by the hardware on
    /// fault entry.
    fn fault_status(&self) -> FaultStatus;
}
