//! Debug monitor
//!
//! A single always-resident, privileged execution context running a
//! signal-driven reactor: wait on the interest mask, dispatch, recompute
//! the mask from pipe occupancy and link state. The monitor owns the comm
//! channel and the board/flash collaborators; it observes kernel state
//! through the introspection surface and never holds a reference to the
//! kernel context across iterations.
//!
//! Back-pressure: the monitor asks for "TX pipe" only while output is
//! queued, and for "comm receive" only while the RX pipe has room.

pub mod xfer;

use core::fmt::Write as _;

use bitflags::bitflags;
use heapless::String;
use log::{debug, info, warn};

use crate::board::{Board, CommChannel, FlashDevice};
use crate::kern::sched::Kernel;
use crate::types::{ThreadId, Ticks};

bitflags! {
    /// Monitor signal kinds. Raised at trap/interrupt level, consumed by
    /// the monitor loop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SigSet: u32 {
        /// Monitor internal reset.
        const RESET            = 1 << 0;
        /// Kernel startup indication.
        const STARTUP          = 1 << 1;
        /// Idle indication.
        const IDLE             = 1 << 2;
        /// Board soft-reset request.
        const SOFTRST          = 1 << 3;
        /// Fault with no thread to blame (kernel/idle context).
        const KRN_FAULT        = 1 << 4;
        /// Monitor timer expiry.
        const ALARM            = 1 << 5;
        /// Thread stopped on a step request.
        const THREAD_STEP      = 1 << 6;
        /// Thread hit a fault.
        const THREAD_FAULT     = 1 << 7;
        /// Thread created.
        const THREAD_CREATE    = 1 << 8;
        /// Thread terminated.
        const THREAD_TERMINATE = 1 << 9;
        /// Breakpoint hit.
        const BREAKPOINT       = 1 << 10;
        /// Comm data pending.
        const COMM_RCV         = 1 << 11;
        /// Comm end of transfer.
        const COMM_EOT         = 1 << 12;
        /// Comm control event (connect/disconnect).
        const COMM_CTL         = 1 << 13;
        /// Console RX pipe has room again.
        const RX_PIPE          = 1 << 14;
        /// Console TX pipe has pending bytes.
        const TX_PIPE          = 1 << 15;
        /// Application stop request.
        const APP_STOP         = 1 << 16;
        /// Firmware upload request.
        const APP_UPLOAD       = 1 << 17;
        /// Application exec request.
        const APP_EXEC         = 1 << 18;
    }
}

/// Kernel-resident half of the monitor session: pending signals, the
/// interest mask published by the loop, and the alarm deadline.
pub struct MonitorLink {
    pub events: SigSet,
    pub mask: SigSet,
    pub alarm: Option<Ticks>,
}

impl MonitorLink {
    pub const fn new() -> Self {
        MonitorLink {
            events: SigSet::empty(),
            mask: SigSet::empty(),
            alarm: None,
        }
    }
}

/// Application image region managed by the upload protocol.
#[derive(Debug, Clone, Copy)]
pub struct AppRegion {
    pub start: u32,
    pub size: u32,
}

/// Autoboot poll interval in ticks.
const AUTOBOOT_POLL_MS: Ticks = 125;

// Control keys dispatched by the monitor before bytes reach the console.
const CTRL_C: u8 = 0x03; // stop application
const CTRL_O: u8 = 0x0f; // kernel info dump
const CTRL_V: u8 = 0x16; // help menu
const CTRL_Y: u8 = 0x19; // firmware upload
const CTRL_Z: u8 = 0x1a; // board soft reset

static MONITOR_MENU: &str = "\r\n\
 Ctrl+C - Stop app\r\n\
 Ctrl+O - Kernel info\r\n\
 Ctrl+V - Help\r\n\
 Ctrl+Y - Upload firmware\r\n\
 Ctrl+Z - Soft reset\r\n";

/// The debug monitor session.
pub struct Monitor<'a> {
    comm: &'a mut dyn CommChannel,
    board: &'a mut dyn Board,
    flash: &'a mut dyn FlashDevice,
    app: AppRegion,
    sigmask: SigSet,
    tick_cnt: u32,
    started: bool,
}

impl<'a> Monitor<'a> {
    /// Build a session over the injected collaborators.
    pub fn new(
        comm: &'a mut dyn CommChannel,
        board: &'a mut dyn Board,
        flash: &'a mut dyn FlashDevice,
        app: AppRegion,
    ) -> Self {
        let sigmask = SigSet::SOFTRST
            | SigSet::KRN_FAULT
            | SigSet::THREAD_FAULT
            | SigSet::BREAKPOINT
            | SigSet::COMM_RCV
            | SigSet::COMM_CTL
            | SigSet::RX_PIPE
            | SigSet::TX_PIPE
            | SigSet::APP_STOP
            | SigSet::APP_UPLOAD;
        Monitor {
            comm,
            board,
            flash,
            app,
            sigmask,
            tick_cnt: 0,
            started: false,
        }
    }

    /// Current interest mask, for tests asserting back-pressure.
    pub fn interest(&self) -> SigSet {
        self.sigmask
    }

    /// Take the pending signals selected by the interest mask and publish
    /// the mask for the kernel side.
    fn select(&mut self, kern: &mut Kernel) -> SigSet {
        let link = kern.mon_link();
        link.mask = self.sigmask;
        let pending = link.events & self.sigmask;
        link.events &= !pending;
        pending
    }

    /// One reactor iteration: dispatch every selected signal. Returns
    /// `false` when nothing was pending (the caller parks the CPU).
    pub fn poll(&mut self, kern: &mut Kernel) -> bool {
        if !self.started {
            self.started = true;
            kern.console_connect_set(self.comm.is_connected());
            // First run: arm the autoboot poll timer.
            self.sigmask |= SigSet::ALARM;
            kern.mon_alarm_set(AUTOBOOT_POLL_MS);
            info!("monitor started");
        }

        let sigset = self.select(kern);
        if sigset.is_empty() {
            return false;
        }

        if sigset.contains(SigSet::SOFTRST) {
            debug!("soft reset");
            self.board.softreset();
        }

        if sigset.contains(SigSet::COMM_CTL) {
            let connected = self.comm.is_connected();
            if connected != kern.console_connected() {
                kern.console_connect_set(connected);
                // Consume the echo of our own state change.
                kern.mon_link().events.remove(SigSet::COMM_CTL);
            }
        }

        if sigset.intersects(SigSet::THREAD_FAULT | SigSet::KRN_FAULT) {
            self.report_fault(kern);
        }

        if sigset.contains(SigSet::COMM_RCV) {
            self.pump_comm_rx(kern);
        }

        if sigset.contains(SigSet::RX_PIPE) {
            // A reader drained the pipe: accept link input again.
            if kern.console_rx_room() > 0 {
                self.sigmask |= SigSet::COMM_RCV;
            }
        }

        if sigset.contains(SigSet::TX_PIPE) {
            self.pump_console_tx(kern);
        }

        if sigset.contains(SigSet::APP_STOP) {
            self.app_stop(kern);
        }

        if sigset.contains(SigSet::APP_UPLOAD) {
            self.upload_firmware();
        }

        if sigset.contains(SigSet::ALARM) {
            self.autoboot_poll(kern);
        }

        true
    }

    // ------------------------------------------------------------------------
    // Dispatch branches
    // ------------------------------------------------------------------------

    /// Move comm bytes toward the console, filtering monitor control keys.
    fn pump_comm_rx(&mut self, kern: &mut Kernel) {
        let mut buf = [0u8; 1];
        while kern.console_rx_room() > 0 {
            match self.comm.recv(&mut buf) {
                Ok(n) if n > 0 => {
                    let c = buf[0];
                    if !self.process_input(kern, c) {
                        kern.console_rx_push(c);
                    }
                }
                _ => break,
            }
        }
        if kern.console_rx_room() == 0 {
            // Pipe full: stop asking for input until a reader makes room.
            self.sigmask.remove(SigSet::COMM_RCV);
        }
    }

    /// Drain the console TX pipe into the comm channel.
    fn pump_console_tx(&mut self, kern: &mut Kernel) {
        let mut buf = [0u8; 32];
        loop {
            let n = kern.console_tx_drain(&mut buf);
            if n == 0 {
                break;
            }
            if self.comm.send(&buf[..n]).is_err() {
                warn!("comm send failed, dropping {} bytes", n);
                break;
            }
        }
    }

    /// Dispatch a control key; `false` passes the byte to the console.
    fn process_input(&mut self, kern: &mut Kernel, c: u8) -> bool {
        match c {
            CTRL_C => {
                kern.mon_signal(SigSet::APP_STOP);
                true
            }
            CTRL_O => {
                self.print_osinfo(kern);
                true
            }
            CTRL_V => {
                let _ = self.comm.send(MONITOR_MENU.as_bytes());
                true
            }
            CTRL_Y => {
                kern.mon_signal(SigSet::APP_UPLOAD);
                true
            }
            CTRL_Z => {
                kern.mon_signal(SigSet::SOFTRST);
                true
            }
            _ => false,
        }
    }

    /// Pause every live thread.
    fn app_stop(&mut self, kern: &mut Kernel) {
        for i in 0..kern.config().threads {
            let th = ThreadId(i as u8);
            if kern.thread_is_alive(th) {
                let _ = kern.thread_pause(th);
            }
        }
        let _ = self.comm.send(b"\r\n! app stopped\r\n");
    }

    /// Receive a firmware image into the application flash region.
    fn upload_firmware(&mut self) {
        let _ = self.comm.send(b"\r\nupload: start transfer...\r\n");
        match xfer::flash_upload(&mut *self.comm, &mut *self.flash, self.app) {
            Ok(n) => {
                let mut line: String<64> = String::new();
                let _ = write!(line, "\r\nupload: {} bytes written\r\n", n);
                let _ = self.comm.send(line.as_bytes());
            }
            Err(e) => {
                let mut line: String<64> = String::new();
                let _ = write!(line, "\r\nupload failed: {}\r\n", e);
                let _ = self.comm.send(line.as_bytes());
            }
        }
    }

    /// Autoboot tick: start the application once the board agrees.
    fn autoboot_poll(&mut self, kern: &mut Kernel) {
        self.tick_cnt += 1;
        if self.board.autoboot(self.tick_cnt) {
            self.sigmask.remove(SigSet::ALARM);
            self.board.on_app_load();
            kern.mon_signal(SigSet::APP_EXEC);
        } else {
            kern.mon_alarm_set(AUTOBOOT_POLL_MS);
        }
    }

    /// Dump the frozen exception record over the channel.
    fn report_fault(&mut self, kern: &mut Kernel) {
        let mut out: String<256> = String::new();
        match kern.exception_record() {
            Some(rec) => {
                let _ = write!(
                    out,
                    "\r\n!! {} pc={:08x} addr={:08x}",
                    rec.kind.name(),
                    rec.ctx.pc,
                    rec.status.address
                );
                match rec.thread {
                    Some(th) => {
                        let tag = kern.thread_tag(th).unwrap_or("?");
                        let _ = write!(out, " thread={} ({})\r\n", th, tag);
                    }
                    None => {
                        let _ = write!(out, " (kernel)\r\n");
                    }
                }
            }
            None => {
                let _ = write!(out, "\r\n!! fault (no record)\r\n");
            }
        }
        let _ = self.comm.send(out.as_bytes());
    }

    /// Kernel info dump: tick count and per-thread state table.
    fn print_osinfo(&mut self, kern: &mut Kernel) {
        let mut out: String<512> = String::new();
        let _ = write!(out, "\r\nticks={}\r\n", kern.ticks());
        for i in 0..kern.config().threads {
            let th = ThreadId(i as u8);
            if !kern.thread_is_alive(th) {
                continue;
            }
            let state = kern.thread_state(th);
            let tag = kern.thread_tag(th).unwrap_or("-");
            let _ = write!(out, " {:2} {:10} {}\r\n", i, tag, state.name());
        }
        let _ = self.comm.send(out.as_bytes());
    }
}
