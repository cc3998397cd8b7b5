//! Firmware transfer protocol
//!
//! Packetized XMODEM-style receive: SOH/STX framing with sequence number
//! and inverted sequence, CRC-16/CCITT (or the arithmetic checksum in
//! fallback mode), bounded retries, cancel on CAN. Storage writes are
//! delegated to the flash-device collaborator; the protocol itself never
//! touches memory layout.

use log::{debug, warn};

use crate::board::{CommChannel, FlashDevice};
use crate::monitor::AppRegion;
use crate::types::Error;

// Protocol control bytes.
pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// CRC-mode handshake byte.
pub const CRC_SYNC: u8 = b'C';

/// Consecutive failures tolerated before the transfer aborts.
const MAX_RETRIES: u32 = 10;

/// CRC-16/CCITT over one byte.
fn crc16_ccitt(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ 0x1021
        } else {
            crc << 1
        };
    }
    crc
}

/// Receiver state for one transfer.
pub struct XferRecv {
    /// Next expected sequence number.
    pktno: u8,
    crc_mode: bool,
    /// Byte sent to solicit (or acknowledge) the next packet.
    sync: u8,
    retries: u32,
    /// Total payload bytes accepted.
    count: usize,
    /// Reassembly buffer: longest frame is STX + seq + ~seq + 1k + crc16.
    buf: [u8; 1024 + 5],
}

/// One step of the receive loop.
pub enum XferEvent<'a> {
    /// A payload chunk was validated and accepted.
    Data(&'a [u8]),
    /// End of transmission acknowledged.
    Done,
}

impl XferRecv {
    pub fn new(crc_mode: bool) -> Self {
        XferRecv {
            pktno: 1,
            crc_mode,
            sync: if crc_mode { CRC_SYNC } else { NAK },
            retries: MAX_RETRIES,
            count: 0,
            buf: [0; 1024 + 5],
        }
    }

    /// Payload bytes accepted so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Receive and validate the next packet.
    ///
    /// Retries locally on timeout, bad checksum and bad sequence up to the
    /// bound, then cancels the transfer with a terminal `ProtocolError`.
    /// A CAN byte from the sender aborts with `Canceled`.
    pub fn recv_pkt(&mut self, comm: &mut dyn CommChannel) -> Result<XferEvent<'_>, Error> {
        loop {
            // Solicit the next packet (sync handshake or ACK of the last).
            comm.send(&[self.sync])?;

            let payload_len = match self.read_frame_start(comm) {
                Ok(Some(len)) => len,
                Ok(None) => {
                    // EOT: acknowledge and finish.
                    comm.send(&[ACK])?;
                    debug!("transfer complete, {} bytes", self.count);
                    return Ok(XferEvent::Done);
                }
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(_) => {
                    if self.give_up(comm)? {
                        return Err(Error::ProtocolError);
                    }
                    continue;
                }
            };

            match self.read_body(comm, payload_len) {
                Ok(true) => {
                    self.retries = MAX_RETRIES;
                    self.sync = ACK;
                    self.pktno = self.pktno.wrapping_add(1);
                    self.count += payload_len;
                    return Ok(XferEvent::Data(&self.buf[3..3 + payload_len]));
                }
                // Duplicate of the previous packet: acknowledge again.
                Ok(false) => {
                    self.sync = ACK;
                    continue;
                }
                Err(e) => {
                    if e == Error::Timeout {
                        // Sync was lost mid-frame: discard the remainder.
                        self.flush(comm);
                    }
                    self.sync = NAK;
                    if self.give_up(comm)? {
                        return Err(Error::ProtocolError);
                    }
                }
            }
        }
    }

    /// Read the frame type byte; `Some(len)` for a data frame, `None` for
    /// EOT.
    fn read_frame_start(&mut self, comm: &mut dyn CommChannel) -> Result<Option<usize>, Error> {
        let mut b = [0u8; 1];
        loop {
            let n = comm.recv(&mut b)?;
            if n == 0 {
                return Err(Error::Timeout);
            }
            match b[0] {
                SOH => return Ok(Some(128)),
                STX => return Ok(Some(1024)),
                EOT => return Ok(None),
                CAN => {
                    warn!("transfer canceled by sender");
                    return Err(Error::Canceled);
                }
                // Line noise between frames: keep scanning.
                _ => continue,
            }
        }
    }

    /// Read sequence, payload and check bytes; `Ok(true)` accepts the
    /// packet, `Ok(false)` drops a duplicate.
    fn read_body(&mut self, comm: &mut dyn CommChannel, payload_len: usize) -> Result<bool, Error> {
        let total = 2 + payload_len + if self.crc_mode { 2 } else { 1 };
        let mut got = 0;
        while got < total {
            let n = comm.recv(&mut self.buf[1 + got..1 + total])?;
            if n == 0 {
                return Err(Error::Timeout);
            }
            got += n;
        }

        let seq = self.buf[1];
        let nseq = self.buf[2];
        if seq != !nseq {
            warn!("bad sequence pair {:02x}/{:02x}", seq, nseq);
            return Err(Error::ProtocolError);
        }

        let data = &self.buf[3..3 + payload_len];
        if self.crc_mode {
            let mut crc = 0u16;
            for &b in data {
                crc = crc16_ccitt(crc, b);
            }
            let got_crc =
                ((self.buf[3 + payload_len] as u16) << 8) | self.buf[3 + payload_len + 1] as u16;
            if crc != got_crc {
                warn!("crc mismatch {:04x} != {:04x}", crc, got_crc);
                return Err(Error::ProtocolError);
            }
        } else {
            let sum = data.iter().fold(0u8, |a, &b| a.wrapping_add(b));
            if sum != self.buf[3 + payload_len] {
                warn!("checksum mismatch");
                return Err(Error::ProtocolError);
            }
        }

        if seq == self.pktno.wrapping_sub(1) {
            // Retransmission of a packet we already accepted.
            debug!("duplicate packet {}", seq);
            return Ok(false);
        }
        if seq != self.pktno {
            warn!("out-of-order packet {} (expected {})", seq, self.pktno);
            return Err(Error::ProtocolError);
        }
        Ok(true)
    }

    /// Burn one retry; when none remain, cancel the transfer on the wire.
    fn give_up(&mut self, comm: &mut dyn CommChannel) -> Result<bool, Error> {
        self.retries -= 1;
        if self.retries == 0 {
            let _ = comm.send(&[CAN, CAN]);
            warn!("transfer aborted after retries");
            return Ok(true);
        }
        Ok(false)
    }

    /// Discard buffered line noise after a framing error.
    fn flush(&mut self, comm: &mut dyn CommChannel) {
        let mut sink = [0u8; 64];
        while matches!(comm.recv(&mut sink), Ok(n) if n > 0) {}
    }
}

/// Receive a firmware image into the application flash region.
///
/// Erases the region, then streams validated packets straight to the
/// flash device; returns the byte count written.
pub fn flash_upload(
    comm: &mut dyn CommChannel,
    flash: &mut dyn FlashDevice,
    region: AppRegion,
) -> Result<usize, Error> {
    flash.unlock()?;
    flash.erase(region.start, region.size)?;

    let mut rx = XferRecv::new(true);
    let mut offset = region.start;
    loop {
        let mut finished = false;
        let mut advanced = 0u32;
        match rx.recv_pkt(comm)? {
            XferEvent::Done => finished = true,
            XferEvent::Data(data) => {
                // Excess past the region end is dropped, not written.
                let room = (region.start + region.size).saturating_sub(offset) as usize;
                let take = data.len().min(room);
                if take > 0 {
                    flash.write(offset, &data[..take])?;
                }
                advanced = take as u32;
            }
        }
        if finished {
            return Ok(rx.count().min(region.size as usize));
        }
        offset += advanced;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::mock::{MockFlash, ScriptedComm};

    fn packet(seq: u8, payload: &[u8; 128]) -> Vec<u8> {
        let mut pkt = vec![SOH, seq, !seq];
        pkt.extend_from_slice(payload);
        let mut crc = 0u16;
        for &b in payload.iter() {
            crc = crc16_ccitt(crc, b);
        }
        pkt.push((crc >> 8) as u8);
        pkt.push((crc & 0xff) as u8);
        pkt
    }

    #[test]
    fn crc16_ccitt_known_vector() {
        // CRC-16/XMODEM of "123456789" is 0x31C3.
        let crc = b"123456789".iter().fold(0u16, |c, &b| crc16_ccitt(c, b));
        assert_eq!(crc, 0x31c3);
    }

    #[test]
    fn accepts_a_valid_packet_sequence() {
        let mut comm = ScriptedComm::new();
        comm.push_rx(&packet(1, &[0xaa; 128]));
        comm.push_rx(&packet(2, &[0xbb; 128]));
        comm.push_rx(&[EOT]);

        let mut rx = XferRecv::new(true);
        assert!(matches!(rx.recv_pkt(&mut comm), Ok(XferEvent::Data(d)) if d == &[0xaa; 128][..]));
        assert!(matches!(rx.recv_pkt(&mut comm), Ok(XferEvent::Data(d)) if d == &[0xbb; 128][..]));
        assert!(matches!(rx.recv_pkt(&mut comm), Ok(XferEvent::Done)));
        assert_eq!(rx.count(), 256);

        // Handshake, two ACKs, final ACK for EOT.
        assert_eq!(comm.tx[0], CRC_SYNC);
        assert!(comm.tx.contains(&ACK));
    }

    #[test]
    fn corrupt_crc_is_refused_then_retried() {
        let mut comm = ScriptedComm::new();
        let mut bad = packet(1, &[0x11; 128]);
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        comm.push_rx(&bad);
        comm.push_rx(&packet(1, &[0x11; 128]));

        let mut rx = XferRecv::new(true);
        assert!(matches!(rx.recv_pkt(&mut comm), Ok(XferEvent::Data(_))));
        // The retry solicited with NAK after the bad frame.
        assert!(comm.tx.contains(&NAK));
        assert_eq!(rx.count(), 128);
    }

    #[test]
    fn duplicate_packet_is_acknowledged_not_restored() {
        let mut comm = ScriptedComm::new();
        comm.push_rx(&packet(1, &[0x22; 128]));
        comm.push_rx(&packet(1, &[0x22; 128])); // sender missed our ACK
        comm.push_rx(&packet(2, &[0x33; 128]));

        let mut rx = XferRecv::new(true);
        assert!(matches!(rx.recv_pkt(&mut comm), Ok(XferEvent::Data(_))));
        assert!(matches!(rx.recv_pkt(&mut comm), Ok(XferEvent::Data(d)) if d == &[0x33; 128][..]));
        assert_eq!(rx.count(), 256);
    }

    #[test]
    fn cancel_byte_aborts_immediately() {
        let mut comm = ScriptedComm::new();
        comm.push_rx(&[CAN]);
        let mut rx = XferRecv::new(true);
        assert_eq!(rx.recv_pkt(&mut comm).err(), Some(Error::Canceled));
    }

    #[test]
    fn retries_exhaust_into_terminal_protocol_error() {
        // Empty script: every receive times out.
        let mut comm = ScriptedComm::new();
        let mut rx = XferRecv::new(true);
        assert_eq!(rx.recv_pkt(&mut comm).err(), Some(Error::ProtocolError));
        // The abort went out on the wire.
        let n = comm.tx.len();
        assert_eq!(&comm.tx[n - 2..], &[CAN, CAN]);
    }

    #[test]
    fn out_of_order_sequence_is_an_error() {
        let mut comm = ScriptedComm::new();
        comm.push_rx(&packet(3, &[0x44; 128]));
        let mut rx = XferRecv::new(true);
        // Single bad frame then silence: retries drain to the terminal error.
        assert_eq!(rx.recv_pkt(&mut comm).err(), Some(Error::ProtocolError));
    }

    #[test]
    fn upload_streams_packets_into_flash() {
        let mut comm = ScriptedComm::new();
        comm.push_rx(&packet(1, &[0x5a; 128]));
        comm.push_rx(&packet(2, &[0xa5; 128]));
        comm.push_rx(&[EOT]);
        let mut flash = MockFlash::new(4096);

        let region = crate::monitor::AppRegion {
            start: 0x100,
            size: 1024,
        };
        let n = flash_upload(&mut comm, &mut flash, region).unwrap();
        assert_eq!(n, 256);
        assert_eq!(flash.erases, vec![(0x100, 1024)]);
        assert_eq!(&flash.mem[0x100..0x180], &[0x5a; 128]);
        assert_eq!(&flash.mem[0x180..0x200], &[0xa5; 128]);
    }
}
