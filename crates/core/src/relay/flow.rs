//! Flow-control windows.
//!
//! Two levels: circuit windows start at 1000 cells with SENDMEs worth 100,
//! streams at 500 with SENDMEs worth 50. The receiving side acknowledges at
//! fixed boundaries; circuit SENDMEs echo the running-digest tag of the
//! cell that closed the boundary, and a sender verifies each echo against
//! the tags it recorded, so a blind forger cannot inflate the window.

use std::collections::VecDeque;

use crate::crypto::SendmeTag;
use crate::util::ct;
use veil_common::flow::{
    CIRC_SENDME_INC, CIRC_WINDOW_INIT, STREAM_SENDME_INC, STREAM_WINDOW_INIT,
};
use veil_common::{Result, VeilError};

/// Circuit-level window pair, one per circuit end.
#[derive(Debug)]
pub struct CircWindows {
    /// Cells we may still package and send.
    package: i32,
    /// Cells the peer may still send before we owe a SENDME.
    deliver: i32,
    /// Tags of our sent cells that closed a SENDME boundary, oldest first;
    /// each incoming circuit SENDME must echo the front one.
    expected_tags: VecDeque<SendmeTag>,
    /// Tag of the received cell that closed the current boundary.
    boundary_tag: Option<SendmeTag>,
}

/// What the receiver owes after taking delivery of a cell.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// Nothing due.
    Ok,
    /// Send a circuit SENDME echoing this tag.
    SendmeDue(SendmeTag),
}

impl CircWindows {
    pub fn new() -> Self {
        Self {
            package: CIRC_WINDOW_INIT as i32,
            deliver: CIRC_WINDOW_INIT as i32,
            expected_tags: VecDeque::new(),
            boundary_tag: None,
        }
    }

    pub fn package_window(&self) -> i32 {
        self.package
    }

    pub fn deliver_window(&self) -> i32 {
        self.deliver
    }

    pub fn can_package(&self) -> bool {
        self.package > 0
    }

    /// Account for one sent data cell, remembering its tag when it closes
    /// a SENDME boundary.
    pub fn note_packaged(&mut self, tag: SendmeTag) -> Result<()> {
        if self.package <= 0 {
            return Err(VeilError::internal("packaged past a closed window"));
        }
        self.package -= 1;
        if self.package % CIRC_SENDME_INC as i32 == 0 {
            self.expected_tags.push_back(tag);
        }
        Ok(())
    }

    /// Account for one received data cell. An exhausted window is a
    /// protocol violation by the peer and closes the circuit.
    ///
    /// The window is restored by [`note_sendme_sent`](Self::note_sendme_sent)
    /// only when the acknowledgement actually goes out; a receiver that
    /// stops acknowledging runs its own window down to zero.
    pub fn note_delivered(&mut self, tag: SendmeTag) -> Result<DeliverOutcome> {
        if self.deliver <= 0 {
            return Err(VeilError::protocol("deliver window exhausted"));
        }
        self.deliver -= 1;
        if self.deliver % CIRC_SENDME_INC as i32 == 0 {
            self.boundary_tag = Some(tag);
        }
        if self.deliver + CIRC_SENDME_INC as i32 == CIRC_WINDOW_INIT as i32 {
            let tag = self
                .boundary_tag
                .take()
                .ok_or_else(|| VeilError::internal("sendme boundary without a tag"))?;
            return Ok(DeliverOutcome::SendmeDue(tag));
        }
        Ok(DeliverOutcome::Ok)
    }

    /// Restore the deliver window for a circuit SENDME that was just sent.
    pub fn note_sendme_sent(&mut self) -> Result<()> {
        self.deliver += CIRC_SENDME_INC as i32;
        if self.deliver > CIRC_WINDOW_INIT as i32 {
            return Err(VeilError::internal("deliver window overflow"));
        }
        Ok(())
    }

    /// Apply an incoming circuit SENDME. With authentication required, a
    /// missing or wrong echo is a protocol error.
    pub fn handle_sendme(&mut self, echoed: Option<SendmeTag>, require_auth: bool) -> Result<()> {
        let expected = self.expected_tags.pop_front();
        if require_auth {
            let expected =
                expected.ok_or_else(|| VeilError::protocol("unsolicited circuit SENDME"))?;
            let echoed =
                echoed.ok_or_else(|| VeilError::protocol("circuit SENDME without digest"))?;
            if !ct::bytes_eq(&expected, &echoed) {
                return Err(VeilError::protocol("circuit SENDME digest mismatch"));
            }
        }
        self.package += CIRC_SENDME_INC as i32;
        if self.package > CIRC_WINDOW_INIT as i32 {
            return Err(VeilError::protocol("circuit package window overflow"));
        }
        Ok(())
    }
}

impl Default for CircWindows {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level window pair.
#[derive(Debug)]
pub struct StreamWindows {
    package: i32,
    deliver: i32,
}

impl StreamWindows {
    pub fn new() -> Self {
        Self {
            package: STREAM_WINDOW_INIT as i32,
            deliver: STREAM_WINDOW_INIT as i32,
        }
    }

    pub fn package_window(&self) -> i32 {
        self.package
    }

    pub fn deliver_window(&self) -> i32 {
        self.deliver
    }

    pub fn can_package(&self) -> bool {
        self.package > 0
    }

    pub fn note_packaged(&mut self) -> Result<()> {
        if self.package <= 0 {
            return Err(VeilError::internal("stream packaged past a closed window"));
        }
        self.package -= 1;
        Ok(())
    }

    /// Account for one delivered cell; `true` means a stream SENDME is due.
    pub fn note_delivered(&mut self) -> Result<bool> {
        if self.deliver <= 0 {
            return Err(VeilError::protocol("stream deliver window exhausted"));
        }
        self.deliver -= 1;
        if self.deliver + STREAM_SENDME_INC as i32 == STREAM_WINDOW_INIT as i32 {
            return Ok(true);
        }
        Ok(false)
    }

    /// Restore the deliver window for a stream SENDME that was just sent.
    pub fn note_sendme_sent(&mut self) -> Result<()> {
        self.deliver += STREAM_SENDME_INC as i32;
        if self.deliver > STREAM_WINDOW_INIT as i32 {
            return Err(VeilError::internal("stream deliver window overflow"));
        }
        Ok(())
    }

    pub fn handle_sendme(&mut self) -> Result<()> {
        self.package += STREAM_SENDME_INC as i32;
        if self.package > STREAM_WINDOW_INIT as i32 {
            return Err(VeilError::protocol("stream package window overflow"));
        }
        Ok(())
    }
}

impl Default for StreamWindows {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(n: u8) -> SendmeTag {
        [n; 20]
    }

    #[test]
    fn test_circuit_sendme_due_at_boundary() {
        let mut w = CircWindows::new();
        for i in 0..99 {
            assert_eq!(w.note_delivered(tag(i as u8)).unwrap(), DeliverOutcome::Ok);
        }
        // The 100th delivery crosses 1000 -> 900: a SENDME echoing that
        // cell's tag is due, and sending it restores the window
        match w.note_delivered(tag(99)).unwrap() {
            DeliverOutcome::SendmeDue(t) => assert_eq!(t, tag(99)),
            other => panic!("expected sendme, got {:?}", other),
        }
        assert_eq!(w.deliver_window(), 900);
        w.note_sendme_sent().unwrap();
        assert_eq!(w.deliver_window(), CIRC_WINDOW_INIT as i32);
    }

    #[test]
    fn test_circuit_sender_verifies_echo() {
        let mut sender = CircWindows::new();
        for i in 0..100u32 {
            sender.note_packaged(tag(i as u8)).unwrap();
        }
        assert_eq!(sender.package_window(), 900);

        // Correct echo: the 100th cell's tag
        sender.handle_sendme(Some(tag(99)), true).unwrap();
        assert_eq!(sender.package_window(), 1000);
    }

    #[test]
    fn test_circuit_sendme_wrong_echo_rejected() {
        let mut sender = CircWindows::new();
        for i in 0..100u32 {
            sender.note_packaged(tag(i as u8)).unwrap();
        }
        assert!(sender.handle_sendme(Some(tag(42)), true).is_err());
    }

    #[test]
    fn test_circuit_sendme_unsolicited_rejected() {
        let mut sender = CircWindows::new();
        assert!(sender.handle_sendme(Some(tag(1)), true).is_err());
    }

    #[test]
    fn test_circuit_sendme_missing_digest_rejected() {
        let mut sender = CircWindows::new();
        for i in 0..100u32 {
            sender.note_packaged(tag(i as u8)).unwrap();
        }
        assert!(sender.handle_sendme(None, true).is_err());
        // Legacy mode accepts it
        let mut legacy = CircWindows::new();
        for i in 0..100u32 {
            legacy.note_packaged(tag(i as u8)).unwrap();
        }
        legacy.handle_sendme(None, false).unwrap();
    }

    #[test]
    fn test_deliver_window_exhaustion_is_protocol_error() {
        // A receiver that never sends its SENDMEs accepts exactly 1000
        // cells; the 1001st is a protocol violation.
        let mut w = CircWindows::new();
        for i in 0..1000u32 {
            w.note_delivered(tag((i % 256) as u8)).unwrap();
        }
        assert_eq!(w.deliver_window(), 0);
        assert!(w.note_delivered(tag(0)).is_err());
    }

    #[test]
    fn test_package_window_stalls_at_zero() {
        let mut w = CircWindows::new();
        for i in 0..1000u32 {
            assert!(w.can_package());
            w.note_packaged(tag((i % 256) as u8)).unwrap();
        }
        assert!(!w.can_package());
        assert!(w.note_packaged(tag(0)).is_err());
    }

    #[test]
    fn test_package_window_overflow_rejected() {
        let mut w = CircWindows::new();
        for i in 0..100u32 {
            w.note_packaged(tag(i as u8)).unwrap();
        }
        w.handle_sendme(Some(tag(99)), true).unwrap();
        // A second SENDME with nothing outstanding would overflow
        assert!(w.handle_sendme(Some(tag(99)), true).is_err());
    }

    #[test]
    fn test_stream_windows() {
        let mut w = StreamWindows::new();
        for _ in 0..49 {
            assert!(!w.note_delivered().unwrap());
        }
        // 50th delivery crosses 500 -> 450: SENDME due
        assert!(w.note_delivered().unwrap());
        assert_eq!(w.deliver_window(), 450);
        w.note_sendme_sent().unwrap();
        assert_eq!(w.deliver_window(), STREAM_WINDOW_INIT as i32);

        for _ in 0..500 {
            w.note_packaged().unwrap();
        }
        assert!(!w.can_package());
        w.handle_sendme().unwrap();
        assert_eq!(w.package_window(), STREAM_SENDME_INC as i32);
    }

    #[test]
    fn test_stream_window_overflow_rejected() {
        let mut w = StreamWindows::new();
        assert!(w.handle_sendme().is_err());
    }
}
