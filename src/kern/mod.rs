//! Kern subsystem - the kernel's concurrency core
//!
//! Contains the wait-queue object model, the scheduler and thread
//! lifecycle, the clock/timeout machinery, the synchronization primitives,
//! the interrupt-wait bridge and fault capture.
//!
//! The whole of the mutable kernel state lives in one [`sched::Kernel`]
//! value, owned by the scheduler module. On a target it is installed once
//! at boot behind a spin lock that stands in for the trap/interrupt
//! critical section; host tests build their own instance and drive the
//! trap methods directly.

pub mod clock;
pub mod cond;
pub mod console;
pub mod event;
pub mod except;
pub mod flag;
pub mod gate;
pub mod irq;
pub mod mutex;
pub mod obj;
pub mod sched;
pub mod semaphore;
pub mod thread;
pub mod wait;

use spin::{Mutex, Once};

use crate::config::KernelConfig;
use crate::port::CpuPort;
use crate::types::Error;

pub use obj::ObjectKind;
pub use sched::Kernel;
pub use thread::{ThreadInit, ThreadState};

/// Global kernel context, installed once at boot.
static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Installed CPU port.
static PORT: Once<&'static dyn CpuPort> = Once::new();

/// Resolve configuration and install the kernel context and CPU port.
///
/// Must run before any other kernel service; repeated calls keep the
/// first installation.
pub fn init(cfg: KernelConfig, port: &'static dyn CpuPort) -> Result<(), Error> {
    cfg.validate()?;
    PORT.call_once(|| port);
    KERNEL.call_once(|| Mutex::new(Kernel::new(cfg)));
    Ok(())
}

/// Run `f` with the global kernel context locked.
///
/// This is the trap/interrupt entry embodiment: callers must not hold the
/// guard across anything but the handler body, preserving the "mutated
/// only inside trap/IRQ level" invariant.
pub fn with_kernel<F, R>(f: F) -> R
where
    F: FnOnce(&mut Kernel) -> R,
{
    let kern = KERNEL.get().expect("kernel not initialized");
    let mut guard = kern.lock();
    f(&mut guard)
}

/// Consume the deferred-reschedule flag, asking the port to perform the
/// context swap at its next reentry point. Called by the trap and
/// interrupt return glue, never from the middle of a handler.
pub fn reschedule_if_pending() {
    let pending = with_kernel(|k| k.take_resched_pending());
    if pending {
        if let Some(port) = PORT.get() {
            port.request_resched();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::TestPort;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static TEST_PORT: TestPort = TestPort {
        resched_requests: AtomicUsize::new(0),
        idle_waits: AtomicUsize::new(0),
    };

    #[test]
    fn global_install_and_deferred_resched() {
        init(KernelConfig::default(), &TEST_PORT).unwrap();

        // A ready-set change inside a trap defers the switch.
        with_kernel(|k| {
            let th = k
                .thread_create(ThreadInit::new(0x0800_0000, 0, 0x2000_0000, 512))
                .unwrap();
            assert!(k.is_ready(th));
        });
        let before = TEST_PORT.resched_requests.load(Ordering::Relaxed);
        reschedule_if_pending();
        assert!(TEST_PORT.resched_requests.load(Ordering::Relaxed) > before);

        // The flag was consumed; nothing further pending.
        let again = TEST_PORT.resched_requests.load(Ordering::Relaxed);
        reschedule_if_pending();
        assert_eq!(TEST_PORT.resched_requests.load(Ordering::Relaxed), again);
    }
}
