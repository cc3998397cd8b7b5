//! Console pipes
//!
//! Two fixed-capacity byte pipes connect ordinary threads to the debug
//! monitor, which shuttles bytes between the pipes and the comm channel.
//! Threads block on the console queues when the RX pipe runs dry or the TX
//! pipe fills; every commit on the monitor side wakes the corresponding
//! queue and raises the pipe signals that drive the monitor's interest
//! mask (the back-pressure loop).

use heapless::Deque;
use log::trace;

use crate::kern::sched::{Kernel, WQ_CONSOLE_RD, WQ_CONSOLE_WR};
use crate::monitor::SigSet;
use crate::types::{Error, Outcome, ThreadId, TrapResult};

/// RX pipe capacity (monitor to threads).
pub const CONSOLE_RX_LEN: usize = 64;
/// TX pipe capacity (threads to monitor).
pub const CONSOLE_TX_LEN: usize = 128;

/// Console pipe pair plus link state.
pub struct Console {
    rx: Deque<u8, CONSOLE_RX_LEN>,
    tx: Deque<u8, CONSOLE_TX_LEN>,
    connected: bool,
}

impl Console {
    pub const fn new() -> Self {
        Console {
            rx: Deque::new(),
            tx: Deque::new(),
            connected: false,
        }
    }
}

impl Kernel {
    // ------------------------------------------------------------------------
    // Thread-side traps
    // ------------------------------------------------------------------------

    /// Read available console input into `buf`.
    ///
    /// Returns the byte count, or blocks when the pipe is empty; a woken
    /// reader re-issues the trap to collect the data.
    pub fn console_read(&mut self, th: ThreadId, buf: &mut [u8]) -> TrapResult {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if !self.console.connected {
            return Err(Error::Canceled);
        }

        let mut n = 0;
        while n < buf.len() {
            match self.console.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if n == 0 {
            self.wq_insert(WQ_CONSOLE_RD, th);
            self.retval_set(th, 0);
            self.defer_sched();
            return Ok(Outcome::Blocked);
        }
        // Room opened up: let the monitor accept more link input.
        self.mon_signal(SigSet::RX_PIPE);
        Ok(Outcome::Done(n as u32))
    }

    /// Write `buf` to the console output pipe.
    ///
    /// Accepts what fits and reports the count; with the pipe full the
    /// caller blocks until the monitor drains it.
    pub fn console_write(&mut self, th: ThreadId, buf: &[u8]) -> TrapResult {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let mut n = 0;
        for &b in buf {
            if self.console.tx.push_back(b).is_err() {
                break;
            }
            n += 1;
        }
        if n > 0 {
            self.mon_signal(SigSet::TX_PIPE);
            trace!("{} queued {} console bytes", th, n);
            return Ok(Outcome::Done(n as u32));
        }
        self.wq_insert(WQ_CONSOLE_WR, th);
        self.retval_set(th, 0);
        self.defer_sched();
        Ok(Outcome::Blocked)
    }

    // ------------------------------------------------------------------------
    // Monitor-side pump
    // ------------------------------------------------------------------------

    /// Bytes queued for the link.
    pub fn console_tx_pending(&self) -> usize {
        self.console.tx.len()
    }

    /// Free space in the RX pipe.
    pub fn console_rx_room(&self) -> usize {
        CONSOLE_RX_LEN - self.console.rx.len()
    }

    /// Drain up to `buf.len()` output bytes for the link; wakes writers
    /// blocked on the full pipe.
    pub fn console_tx_drain(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.console.tx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 && self.wake_all(WQ_CONSOLE_WR, 0) > 0 {
            self.defer_sched();
        }
        n
    }

    /// Push one received byte toward threads; wakes blocked readers.
    /// Returns `false` when the pipe is full (monitor applies back-pressure).
    pub fn console_rx_push(&mut self, byte: u8) -> bool {
        if self.console.rx.push_back(byte).is_err() {
            return false;
        }
        if self.wake_all(WQ_CONSOLE_RD, 0) > 0 {
            self.defer_sched();
        }
        true
    }

    /// Record the comm link state; a drop releases blocked readers with
    /// `Canceled` so no thread waits on a dead link.
    pub fn console_connect_set(&mut self, connected: bool) {
        if self.console.connected && !connected {
            let code = Error::Canceled.code() as u32;
            if self.wake_all(WQ_CONSOLE_RD, code) > 0 {
                self.defer_sched();
            }
        }
        self.console.connected = connected;
        self.mon_signal(SigSet::COMM_CTL);
    }

    /// Whether the comm link is attached.
    pub fn console_connected(&self) -> bool {
        self.console.connected
    }
}
