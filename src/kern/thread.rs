//! Thread lifecycle and context store
//!
//! A thread is a small integer id, a saved register context, stack bounds
//! and a symbolic tag. Creation installs an initial context so the thread
//! "returns" into its entry function; exit is a one-way continuation: the
//! trap return address is rewritten to the terminate stub, freezing the
//! call site's registers as the before-death image. Abort is exhaustive -
//! a thread that is both lock holder and waiter leaves no dangling
//! references behind.

use log::{debug, trace};

use crate::kern::sched::{Kernel, WQ_CANCELED, WQ_PAUSED, WQ_READY, WQ_TMSHARE};
use crate::monitor::SigSet;
use crate::types::{Error, Outcome, ThreadId, TrapResult};

// ============================================================================
// Saved context
// ============================================================================

/// Per-thread saved register file.
///
/// Layout mirrors the exception frame of the target: the automatic part
/// (r0-r3, r12, lr, pc, xpsr) is pushed by hardware on trap entry, the
/// rest by the context-switch code. `r0` doubles as the syscall
/// return-value slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
    pub sp: u32,
}

/// Thumb state bit of the program status register.
const XPSR_THUMB: u32 = 1 << 24;

impl Context {
    /// Bytes a context frame occupies on the thread stack.
    pub const FRAME_SIZE: u32 = core::mem::size_of::<Context>() as u32;

    /// Build the initial context so the first dispatch "returns" into
    /// `entry(arg)` with `lr` aimed at the exit continuation.
    pub fn init(entry: u32, arg: u32, sp: u32, exit_veneer: u32) -> Self {
        let sp = (sp & !0x7).wrapping_sub(Self::FRAME_SIZE);
        Context {
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r0: arg,
            r1: 0,
            r2: 0,
            r3: 0,
            r12: 0,
            lr: exit_veneer,
            pc: entry & !1,
            xpsr: XPSR_THUMB,
            sp,
        }
    }
}

// ============================================================================
// Thread table entry
// ============================================================================

/// One slot of the thread table.
#[derive(Debug, Clone, Copy)]
pub struct ThreadSlot {
    /// Saved context; `None` marks a dead or never-created thread.
    pub(crate) ctx: Option<Context>,
    pub(crate) stack_base: u32,
    pub(crate) stack_size: u32,
    pub(crate) tag: Option<&'static str>,
}

impl ThreadSlot {
    pub const EMPTY: ThreadSlot = ThreadSlot {
        ctx: None,
        stack_base: 0,
        stack_size: 0,
        tag: None,
    };
}

/// Thread-create descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ThreadInit {
    pub entry: u32,
    pub arg: u32,
    pub stack_base: u32,
    pub stack_size: u32,
    /// Requested slot; the allocator tries it first, then scans free ids
    /// from high to low so system threads keep low, predictable ids.
    pub id: Option<u8>,
    /// Time-share weight (lower weight = larger share).
    pub priority: u8,
    /// Start parked on the paused queue.
    pub paused: bool,
    pub tag: Option<&'static str>,
}

impl ThreadInit {
    pub fn new(entry: u32, arg: u32, stack_base: u32, stack_size: u32) -> Self {
        ThreadInit {
            entry,
            arg,
            stack_base,
            stack_size,
            id: None,
            priority: 1,
            paused: false,
            tag: None,
        }
    }

    pub fn with_id(mut self, id: u8) -> Self {
        self.id = Some(id);
        self
    }

    pub fn priority(mut self, weight: u8) -> Self {
        self.priority = weight;
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    pub fn tag(mut self, tag: &'static str) -> Self {
        self.tag = Some(tag);
        self
    }
}

/// Observable thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked(usize),
    TimeWaiting(usize),
    Paused,
    Canceled,
    Aborted,
}

impl ThreadState {
    pub fn name(&self) -> &'static str {
        match self {
            ThreadState::Ready => "ready",
            ThreadState::Running => "running",
            ThreadState::Blocked(_) => "blocked",
            ThreadState::TimeWaiting(_) => "time-wait",
            ThreadState::Paused => "paused",
            ThreadState::Canceled => "canceled",
            ThreadState::Aborted => "aborted",
        }
    }
}

// ============================================================================
// Lifecycle traps
// ============================================================================

impl Kernel {
    /// Create a thread from a descriptor.
    ///
    /// The stack must hold at least one context frame. The requested id is
    /// tried first; otherwise free ids are scanned from high to low.
    pub fn thread_create(&mut self, init: ThreadInit) -> Result<ThreadId, Error> {
        if init.stack_size < Context::FRAME_SIZE {
            return Err(Error::InvalidArgument);
        }

        let th = self.thread_alloc(init.id)?;
        let sp = init.stack_base.wrapping_add(init.stack_size);
        let ctx = Context::init(init.entry, init.arg, sp, self.exit_veneer);

        let slot = &mut self.threads[th.index()];
        slot.ctx = Some(ctx);
        slot.stack_base = init.stack_base;
        slot.stack_size = init.stack_size;
        slot.tag = init.tag;

        self.stat_clr(th);
        self.clock[th.index()] = 0;
        if self.cfg.timeshare {
            self.timeshare_enroll(th, init.priority);
        }

        if init.paused {
            self.wq[WQ_PAUSED] |= th.bit();
        } else {
            self.wq[WQ_READY] |= th.bit();
            self.defer_sched();
        }

        debug!("created {} tag={:?}", th, init.tag);
        self.mon_signal(SigSet::THREAD_CREATE);
        Ok(th)
    }

    fn thread_alloc(&mut self, requested: Option<u8>) -> Result<ThreadId, Error> {
        let count = self.cfg.threads;
        if let Some(id) = requested {
            if (id as usize) < count && self.th_alloc & (1 << id) == 0 {
                self.th_alloc |= 1 << id;
                return Ok(ThreadId(id));
            }
        }
        match super::obj::bmp_alloc_hi(&mut self.th_alloc, count) {
            Some(idx) => Ok(ThreadId(idx as u8)),
            None => Err(Error::ResourceExhausted),
        }
    }

    /// Whether a thread slot is allocated and alive.
    pub fn thread_is_alive(&self, th: ThreadId) -> bool {
        th.index() < self.cfg.threads && self.th_alloc & th.bit() != 0
    }

    /// Symbolic tag of a thread, if one was given.
    pub fn thread_tag(&self, th: ThreadId) -> Option<&'static str> {
        self.threads[th.index()].tag
    }

    /// Observable state of a thread, for the monitor and tests.
    pub fn thread_state(&self, th: ThreadId) -> ThreadState {
        if !self.thread_is_alive(th) {
            return ThreadState::Aborted;
        }
        if self.active == Some(th) {
            return ThreadState::Running;
        }
        if self.wq[WQ_READY] & th.bit() != 0 || self.wq[WQ_TMSHARE] & th.bit() != 0 {
            return ThreadState::Ready;
        }
        if self.wq[WQ_PAUSED] & th.bit() != 0 {
            return ThreadState::Paused;
        }
        if self.wq[WQ_CANCELED] & th.bit() != 0 {
            return ThreadState::Canceled;
        }
        match self.thread_wait_queue(th) {
            Some(wq) if self.thread_is_clocked(th) => ThreadState::TimeWaiting(wq),
            Some(wq) => ThreadState::Blocked(wq),
            None => ThreadState::Ready,
        }
    }

    /// Exit the calling thread with `code`.
    ///
    /// The saved return address is rewritten to the terminate continuation,
    /// so the call site's register state stays frozen for diagnosis. With
    /// no joiner waiting the thread parks on the canceled queue until one
    /// arrives; otherwise it terminates immediately.
    pub fn thread_exit(&mut self, th: ThreadId, code: u32) -> TrapResult {
        if !self.thread_is_alive(th) {
            return Err(Error::InvalidArgument);
        }
        let veneer = self.exit_veneer;
        if let Some(ctx) = self.threads[th.index()].ctx.as_mut() {
            ctx.pc = veneer;
            ctx.r0 = code;
        }

        if self.wq[self.map.join_wq(th)] == 0 {
            // Nobody joining yet: park until a joiner retrieves the code.
            self.suspend(th);
            self.wq[WQ_CANCELED] |= th.bit();
            self.stat_set(th, WQ_CANCELED, false);
            self.defer_sched();
            trace!("{} exit({}) parked on canceled", th, code);
            return Ok(Outcome::Blocked);
        }

        self.thread_terminate(th, code)
    }

    /// Terminate `th`, delivering `code` to every joiner, then abort it.
    pub fn thread_terminate(&mut self, th: ThreadId, code: u32) -> TrapResult {
        if !self.thread_is_alive(th) {
            return Err(Error::InvalidArgument);
        }

        let join_wq = self.map.join_wq(th);
        if self.wake_all(join_wq, code) > 0 {
            self.defer_sched();
        }
        self.thread_abort(th);
        self.mon_signal(SigSet::THREAD_TERMINATE);
        Ok(Outcome::Blocked)
    }

    /// Release a thread id and every reference the kernel holds to it.
    ///
    /// Exhaustive by contract: queue membership (via the reverse lookup),
    /// the rotation/paused/canceled queues, timeout deadline, interrupt
    /// bindings and owned mutexes are all cleared.
    pub fn thread_abort(&mut self, th: ThreadId) {
        // Queue memberships go before the id is released.
        self.wq_unlink(th);
        self.wq[WQ_TMSHARE] &= !th.bit();
        self.wq[WQ_PAUSED] &= !th.bit();
        self.wq[WQ_CANCELED] &= !th.bit();

        // Unbind any interrupt line still pointing at this thread.
        for slot in self.irq_thread.iter_mut() {
            if *slot == Some(th) {
                *slot = None;
            }
        }

        // Hand owned mutexes to the next waiter so lock holders never
        // leave dangling ownership.
        self.mutex_abandon_all(th);

        if self.cfg.timeshare {
            self.timeshare_rebalance(th);
        }

        self.th_alloc &= !th.bit();
        self.threads[th.index()].ctx = None;
        self.threads[th.index()].tag = None;

        if self.active == Some(th) {
            self.active = None;
        }
        self.suspend(th);
        self.defer_sched();
        debug!("aborted {}", th);
    }

    /// Block the caller until `th` terminates; the exit code arrives in the
    /// caller's return-value slot.
    pub fn thread_join(&mut self, th: ThreadId, target: ThreadId) -> TrapResult {
        if th == target {
            return Err(Error::Deadlock);
        }
        if !self.thread_is_alive(target) {
            return Err(Error::InvalidArgument);
        }

        let join_wq = self.map.join_wq(target);
        self.wq_insert(join_wq, th);
        self.defer_sched();

        // A thread parked on the canceled queue resumes its terminate
        // continuation now that a joiner can retrieve the code.
        if self.wq[WQ_CANCELED] & target.bit() != 0 {
            self.wakeup_keep_retval(WQ_CANCELED, target);
        }
        Ok(Outcome::Blocked)
    }

    /// Divert a thread into the exit path with `code`.
    ///
    /// A blocked target is removed from its wait queue; its continuation
    /// becomes the terminate stub, so the next dispatch finishes the exit.
    pub fn thread_cancel(&mut self, th: ThreadId, code: u32) -> TrapResult {
        if !self.thread_is_alive(th) {
            return Err(Error::InvalidArgument);
        }
        if self.wq[WQ_CANCELED] & th.bit() != 0 {
            // Already exited; nothing to divert.
            return Ok(Outcome::Done(0));
        }

        self.wq_unlink(th);
        self.wq[WQ_PAUSED] &= !th.bit();
        let veneer = self.exit_veneer;
        if let Some(ctx) = self.threads[th.index()].ctx.as_mut() {
            ctx.pc = veneer;
            ctx.r0 = code;
        }
        self.wq[WQ_READY] |= th.bit();
        self.preempt();
        trace!("{} canceled with code {}", th, code);
        Ok(Outcome::Done(0))
    }

    /// Park a ready thread on the paused queue.
    ///
    /// Pausing a thread that is blocked on an object is not supported;
    /// callers get `Again` and may cancel instead.
    pub fn thread_pause(&mut self, th: ThreadId) -> TrapResult {
        if !self.thread_is_alive(th) {
            return Err(Error::InvalidArgument);
        }
        if self.wq[WQ_PAUSED] & th.bit() != 0 {
            return Ok(Outcome::Done(0));
        }
        if self.wq[WQ_READY] & th.bit() == 0 && self.wq[WQ_TMSHARE] & th.bit() == 0 {
            return Err(Error::Again);
        }
        self.wq[WQ_TMSHARE] &= !th.bit();
        self.suspend(th);
        self.wq[WQ_PAUSED] |= th.bit();
        if self.active == Some(th) {
            self.defer_sched();
        }
        Ok(Outcome::Done(0))
    }

    /// Move a paused thread back to the ready set.
    pub fn thread_resume(&mut self, th: ThreadId) -> TrapResult {
        if !self.thread_is_alive(th) {
            return Err(Error::InvalidArgument);
        }
        if self.wq[WQ_PAUSED] & th.bit() == 0 {
            return Ok(Outcome::Done(0));
        }
        self.wq[WQ_PAUSED] &= !th.bit();
        self.wq[WQ_READY] |= th.bit();
        self.preempt();
        Ok(Outcome::Done(0))
    }

    /// Wake a thread without touching its return slot (the slot already
    /// carries the exit code installed by `thread_exit`).
    fn wakeup_keep_retval(&mut self, wq: usize, th: ThreadId) {
        self.wq[WQ_READY] |= th.bit();
        self.wq[wq] &= !th.bit();
        self.stat_clr(th);
        self.defer_sched();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default())
    }

    fn init(id: Option<u8>) -> ThreadInit {
        let mut i = ThreadInit::new(0x0800_1000, 7, 0x2000_0000, 512).tag("test");
        i.id = id;
        i
    }

    #[test]
    fn create_installs_entry_context() {
        let mut k = kernel();
        let th = k.thread_create(init(Some(2))).unwrap();
        assert_eq!(th, ThreadId(2));

        let ctx = k.thread_ctx(th).unwrap();
        assert_eq!(ctx.pc, 0x0800_1000);
        assert_eq!(ctx.r0, 7);
        assert_eq!(ctx.xpsr & (1 << 24), 1 << 24);
        // Stack pointer sits one frame below the 8-byte-aligned top.
        assert_eq!(ctx.sp, (0x2000_0000u32 + 512) - Context::FRAME_SIZE);
        assert!(k.is_ready(th));
    }

    #[test]
    fn undersized_stack_is_rejected() {
        let mut k = kernel();
        let r = k.thread_create(ThreadInit::new(0x0800_1000, 0, 0x2000_0000, 16));
        assert_eq!(r, Err(Error::InvalidArgument));
    }

    #[test]
    fn allocation_prefers_requested_then_scans_high() {
        let mut k = kernel();
        assert_eq!(k.thread_create(init(Some(1))).unwrap(), ThreadId(1));
        // Requested id taken: fall back to the highest free slot.
        assert_eq!(k.thread_create(init(Some(1))).unwrap(), ThreadId(7));
        assert_eq!(k.thread_create(init(None)).unwrap(), ThreadId(6));
    }

    #[test]
    fn table_exhaustion() {
        let cfg = KernelConfig {
            threads: 2,
            ..Default::default()
        };
        let mut k = Kernel::new(cfg);
        k.thread_create(init(None)).unwrap();
        k.thread_create(init(None)).unwrap();
        assert_eq!(k.thread_create(init(None)), Err(Error::ResourceExhausted));
    }

    #[test]
    fn paused_creation_stays_off_the_ready_set() {
        let mut k = kernel();
        let th = k.thread_create(init(Some(3)).paused()).unwrap();
        assert!(!k.is_ready(th));
        assert_eq!(k.thread_state(th), ThreadState::Paused);

        k.thread_resume(th).unwrap();
        assert!(k.is_ready(th));
        k.thread_pause(th).unwrap();
        assert_eq!(k.thread_state(th), ThreadState::Paused);
    }

    #[test]
    fn exit_without_joiner_parks_and_freezes_continuation() {
        let mut k = kernel();
        k.set_exit_veneer(0x0800_fff0);
        let th = k.thread_create(init(Some(0))).unwrap();

        assert_eq!(k.thread_exit(th, 42), Ok(Outcome::Blocked));
        assert_eq!(k.thread_state(th), ThreadState::Canceled);
        let ctx = k.thread_ctx(th).unwrap();
        assert_eq!(ctx.pc, 0x0800_fff0);
        assert_eq!(ctx.r0, 42);
    }

    #[test]
    fn join_releases_canceled_thread_and_delivers_code() {
        let mut k = kernel();
        let worker = k.thread_create(init(Some(1))).unwrap();
        let joiner = k.thread_create(init(Some(2))).unwrap();

        k.thread_exit(worker, 99).unwrap();
        assert_eq!(k.thread_join(joiner, worker), Ok(Outcome::Blocked));
        // The worker woke to run its terminate continuation.
        assert!(k.is_ready(worker));

        // Terminate delivers the code and frees the slot.
        k.thread_terminate(worker, 99).unwrap();
        assert!(k.is_ready(joiner));
        assert_eq!(k.thread_retval(joiner), 99);
        assert!(!k.thread_is_alive(worker));
        assert_eq!(k.thread_state(worker), ThreadState::Aborted);
    }

    #[test]
    fn join_self_is_deadlock() {
        let mut k = kernel();
        let th = k.thread_create(init(Some(1))).unwrap();
        assert_eq!(k.thread_join(th, th), Err(Error::Deadlock));
    }

    #[test]
    fn abort_clears_every_reference() {
        let mut k = kernel();
        let th = k.thread_create(init(Some(4))).unwrap();

        // Block it on a semaphore with a timeout, then abort.
        let sem = k.obj_alloc(crate::kern::obj::ObjectKind::Semaphore).unwrap();
        k.sem_wait_timed(th, sem, 50).unwrap();
        assert!(k.thread_is_clocked(th));

        k.thread_abort(th);
        assert!(!k.thread_is_alive(th));
        for wq in 0..k.map.total {
            assert_eq!(k.wq[wq] & th.bit(), 0, "queue {} still references {}", wq, th);
        }
        assert!(k.thread_ctx(th).is_none());
    }

    #[test]
    fn cancel_unblocks_into_exit_path() {
        let mut k = kernel();
        k.set_exit_veneer(0x0800_fff0);
        let th = k.thread_create(init(Some(1))).unwrap();
        let sem = k.obj_alloc(crate::kern::obj::ObjectKind::Semaphore).unwrap();
        k.sem_wait(th, sem).unwrap();
        assert!(!k.is_ready(th));

        k.thread_cancel(th, 7).unwrap();
        assert!(k.is_ready(th));
        assert_eq!(k.thread_wait_queue(th), None);
        let ctx = k.thread_ctx(th).unwrap();
        assert_eq!(ctx.pc, 0x0800_fff0);
        assert_eq!(ctx.r0, 7);
    }
}
