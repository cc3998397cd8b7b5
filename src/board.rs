//! External collaborator contracts
//!
//! The kernel core never reaches into board, transport or storage
//! internals; each collaborator is a capability trait and a concrete
//! implementation is injected at boot. Any transport satisfying
//! [`CommChannel`] (serial, USB, network) is interchangeable from the
//! monitor's point of view.

use crate::types::{Error, IrqId};

/// Board-level callbacks consumed by boot sequencing and the debug monitor.
pub trait Board {
    /// One-time hardware bring-up.
    fn init(&mut self);

    /// Soft reset: reinitialize peripherals without losing the comm link.
    fn softreset(&mut self);

    /// Periodic autoboot poll from the monitor alarm; return `true` when
    /// the application should be started.
    fn autoboot(&mut self, tick: u32) -> bool;

    /// Notification that the application image was handed control.
    fn on_app_load(&mut self);
}

/// Debug monitor communication channel.
///
/// `recv` may block up to an implementation-defined interval and reports
/// `Error::Timeout` when it elapses with no data; the monitor relies on
/// this for transfer timeouts.
pub trait CommChannel {
    /// Queue bytes for transmission; returns the number accepted.
    fn send(&mut self, buf: &[u8]) -> Result<usize, Error>;

    /// Receive pending bytes; returns the number stored.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Whether the remote end is attached.
    fn is_connected(&self) -> bool;
}

/// Flash storage consumed by the firmware-update sub-protocols.
///
/// Block/sector alignment constraints are the implementation's business,
/// surfaced as `InvalidArgument` results.
pub trait FlashDevice {
    fn unlock(&mut self) -> Result<(), Error>;
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), Error>;
    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<usize, Error>;
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<usize, Error>;
}

/// Interrupt controller surface used by the IRQ-wait bridge.
pub trait IrqControl {
    /// Install a vector for the line and set its priority.
    fn register(&mut self, irq: IrqId, priority: u8, isr: fn(IrqId)) -> Result<(), Error>;

    fn enable(&mut self, irq: IrqId);
    fn disable(&mut self, irq: IrqId);
    fn clear_pending(&mut self, irq: IrqId);
    fn set_priority(&mut self, irq: IrqId, priority: u8);
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted collaborators for host tests.

    use super::*;
    use std::collections::VecDeque;

    /// Interrupt controller that records enable/disable traffic.
    #[derive(Default)]
    pub struct MockIrqCtl {
        pub enabled: u64,
        pub pending: u64,
        pub enables: usize,
        pub disables: usize,
    }

    impl IrqControl for MockIrqCtl {
        fn register(&mut self, _irq: IrqId, _priority: u8, _isr: fn(IrqId)) -> Result<(), Error> {
            Ok(())
        }

        fn enable(&mut self, irq: IrqId) {
            self.enabled |= 1 << irq.index();
            self.enables += 1;
        }

        fn disable(&mut self, irq: IrqId) {
            self.enabled &= !(1 << irq.index());
            self.disables += 1;
        }

        fn clear_pending(&mut self, irq: IrqId) {
            self.pending &= !(1 << irq.index());
        }

        fn set_priority(&mut self, _irq: IrqId, _priority: u8) {}
    }

    /// Comm channel fed from a script of receive chunks.
    pub struct ScriptedComm {
        pub rx: VecDeque<Vec<u8>>,
        pub tx: Vec<u8>,
        pub connected: bool,
    }

    impl ScriptedComm {
        pub fn new() -> Self {
            ScriptedComm {
                rx: VecDeque::new(),
                tx: Vec::new(),
                connected: true,
            }
        }

        pub fn push_rx(&mut self, data: &[u8]) {
            self.rx.push_back(data.to_vec());
        }
    }

    impl CommChannel for ScriptedComm {
        fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            match self.rx.front_mut() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.rx.pop_front();
                    }
                    Ok(n)
                }
                None => Err(Error::Timeout),
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    /// Byte-addressable flash image backed by a plain buffer.
    pub struct MockFlash {
        pub mem: Vec<u8>,
        pub unlocked: bool,
        pub erases: Vec<(u32, u32)>,
    }

    impl MockFlash {
        pub fn new(size: usize) -> Self {
            MockFlash {
                mem: vec![0xff; size],
                unlocked: false,
                erases: Vec::new(),
            }
        }
    }

    impl FlashDevice for MockFlash {
        fn unlock(&mut self) -> Result<(), Error> {
            self.unlocked = true;
            Ok(())
        }

        fn erase(&mut self, offset: u32, len: u32) -> Result<(), Error> {
            if !self.unlocked {
                return Err(Error::InvalidArgument);
            }
            let (start, end) = (offset as usize, (offset + len) as usize);
            if end > self.mem.len() {
                return Err(Error::InvalidArgument);
            }
            self.mem[start..end].fill(0xff);
            self.erases.push((offset, len));
            Ok(())
        }

        fn write(&mut self, offset: u32, buf: &[u8]) -> Result<usize, Error> {
            if !self.unlocked {
                return Err(Error::InvalidArgument);
            }
            let start = offset as usize;
            if start + buf.len() > self.mem.len() {
                return Err(Error::InvalidArgument);
            }
            self.mem[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn read(&self, offset: u32, buf: &mut [u8]) -> Result<usize, Error> {
            let start = offset as usize;
            if start + buf.len() > self.mem.len() {
                return Err(Error::InvalidArgument);
            }
            buf.copy_from_slice(&self.mem[start..start + buf.len()]);
            Ok(buf.len())
        }
    }

    /// Board that counts callback invocations.
    #[derive(Default)]
    pub struct MockBoard {
        pub softresets: usize,
        pub autoboot_after: Option<u32>,
        pub app_loads: usize,
    }

    impl Board for MockBoard {
        fn init(&mut self) {}

        fn softreset(&mut self) {
            self.softresets += 1;
        }

        fn autoboot(&mut self, tick: u32) -> bool {
            matches!(self.autoboot_after, Some(t) if tick >= t)
        }

        fn on_app_load(&mut self) {
            self.app_loads += 1;
        }
    }
}
