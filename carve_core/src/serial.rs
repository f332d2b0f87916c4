//! Serial transport contract and realtime-byte extraction.
//!
//! The transport is an external collaborator: the firmware only sees a
//! non-blocking byte source and a sink. Realtime command bytes never reach
//! the parser — they are translated into realtime flags at the receive
//! boundary, exactly where a UART interrupt would do it.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use carve_common::state::{ExecOverride, ExecState, RtFlags};

/// Byte transport. `read_byte` must never block.
pub trait Transport: Send {
    /// Next buffered data byte, if any.
    fn read_byte(&mut self) -> Option<u8>;
    /// Queue response bytes for the host.
    fn write(&mut self, data: &[u8]);
    /// True once the host side is gone and nothing is buffered.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Translate a realtime command byte into its flag. Returns `true` when
/// the byte was consumed and must not be buffered.
pub fn execute_realtime_byte(byte: u8, rt_flags: &RtFlags) -> bool {
    match byte {
        0x18 => rt_flags.set_state(ExecState::RESET),
        b'?' => rt_flags.set_state(ExecState::STATUS_REPORT),
        b'~' => rt_flags.set_state(ExecState::CYCLE_START),
        b'!' => rt_flags.set_state(ExecState::FEED_HOLD),
        0x85 => rt_flags.set_state(ExecState::MOTION_CANCEL),
        0x90 => rt_flags.set_override(ExecOverride::FEED_RESET),
        0x91 => rt_flags.set_override(ExecOverride::FEED_COARSE_PLUS),
        0x92 => rt_flags.set_override(ExecOverride::FEED_COARSE_MINUS),
        0x93 => rt_flags.set_override(ExecOverride::FEED_FINE_PLUS),
        0x94 => rt_flags.set_override(ExecOverride::FEED_FINE_MINUS),
        0x95 => rt_flags.set_override(ExecOverride::RAPID_RESET),
        0x96 => rt_flags.set_override(ExecOverride::RAPID_MEDIUM),
        0x97 => rt_flags.set_override(ExecOverride::RAPID_LOW),
        // Remaining extended bytes (0x80+) are dropped, not buffered.
        0x80..=0xFF => {}
        _ => return false,
    }
    true
}

// ─── Loopback (tests / simulation) ──────────────────────────────────

/// In-memory transport: injected input, captured output. Realtime bytes
/// are extracted at injection time, mirroring the receive interrupt.
/// The paired [`LoopbackHandle`] stays with the test while the machine
/// owns the transport.
pub struct LoopbackTransport {
    input: Arc<Mutex<VecDeque<u8>>>,
    output: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

/// Host-side end of a [`LoopbackTransport`].
#[derive(Clone)]
pub struct LoopbackHandle {
    rt_flags: Arc<RtFlags>,
    input: Arc<Mutex<VecDeque<u8>>>,
    output: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl LoopbackTransport {
    pub fn pair(rt_flags: Arc<RtFlags>) -> (Self, LoopbackHandle) {
        let input = Arc::new(Mutex::new(VecDeque::new()));
        let output = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                input: Arc::clone(&input),
                output: Arc::clone(&output),
                closed: Arc::clone(&closed),
            },
            LoopbackHandle {
                rt_flags,
                input,
                output,
                closed,
            },
        )
    }
}

impl LoopbackHandle {
    /// Feed host bytes in. Realtime commands take effect immediately.
    pub fn inject(&self, data: &[u8]) {
        let mut input = self.input.lock().unwrap();
        for &byte in data {
            if !execute_realtime_byte(byte, &self.rt_flags) {
                input.push_back(byte);
            }
        }
    }

    /// Drain and return everything the firmware wrote.
    pub fn take_output(&self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut *self.output.lock().unwrap()))
            .into_owned()
    }

    /// Signal end of input; the protocol loop exits once drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Transport for LoopbackTransport {
    fn read_byte(&mut self) -> Option<u8> {
        self.input.lock().unwrap().pop_front()
    }

    fn write(&mut self, data: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(data);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) && self.input.lock().unwrap().is_empty()
    }
}

// ─── Stdio (firmware binary) ────────────────────────────────────────

/// Stdin/stdout transport. A reader thread stands in for the receive
/// interrupt: it extracts realtime bytes inline and forwards the rest.
pub struct StdioTransport {
    rx: Receiver<u8>,
    stdout: std::io::Stdout,
    disconnected: bool,
}

impl StdioTransport {
    /// Spawn the receive thread and return the transport.
    pub fn spawn(rt_flags: Arc<RtFlags>) -> Self {
        let (tx, rx): (Sender<u8>, Receiver<u8>) = mpsc::channel();
        std::thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                let mut stdin = std::io::stdin();
                let mut buf = [0u8; 64];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            for &byte in &buf[..n] {
                                if !execute_realtime_byte(byte, &rt_flags)
                                    && tx.send(byte).is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }
                }
            })
            .expect("serial-rx thread");
        Self {
            rx,
            stdout: std::io::stdout(),
            disconnected: false,
        }
    }
}

impl Transport for StdioTransport {
    fn read_byte(&mut self) -> Option<u8> {
        match self.rx.try_recv() {
            Ok(byte) => Some(byte),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.disconnected = true;
                None
            }
        }
    }

    fn write(&mut self, data: &[u8]) {
        let _ = self.stdout.write_all(data);
        let _ = self.stdout.flush();
    }

    fn is_closed(&self) -> bool {
        self.disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_bytes_set_flags_and_are_not_buffered() {
        let rt_flags = Arc::new(RtFlags::new());
        let (mut transport, handle) = LoopbackTransport::pair(Arc::clone(&rt_flags));
        handle.inject(b"G1!X5\n");
        assert!(rt_flags.state().contains(ExecState::FEED_HOLD));
        let mut line = Vec::new();
        while let Some(b) = transport.read_byte() {
            line.push(b);
        }
        assert_eq!(line, b"G1X5\n");
    }

    #[test]
    fn override_bytes_set_override_flags() {
        let rt_flags = Arc::new(RtFlags::new());
        let (mut transport, handle) = LoopbackTransport::pair(Arc::clone(&rt_flags));
        handle.inject(&[0x91, 0x96]);
        let ov = rt_flags.take_override();
        assert!(ov.contains(ExecOverride::FEED_COARSE_PLUS));
        assert!(ov.contains(ExecOverride::RAPID_MEDIUM));
        assert_eq!(transport.read_byte(), None);
    }

    #[test]
    fn unassigned_extended_bytes_are_dropped() {
        let rt_flags = Arc::new(RtFlags::new());
        let (mut transport, handle) = LoopbackTransport::pair(Arc::clone(&rt_flags));
        handle.inject(&[0xA0, b'G']);
        assert_eq!(transport.read_byte(), Some(b'G'));
        assert_eq!(transport.read_byte(), None);
        assert!(rt_flags.state().is_empty());
    }

    #[test]
    fn loopback_close_drains_first() {
        let rt_flags = Arc::new(RtFlags::new());
        let (mut transport, handle) = LoopbackTransport::pair(rt_flags);
        handle.inject(b"X");
        handle.close();
        assert!(!transport.is_closed());
        assert_eq!(transport.read_byte(), Some(b'X'));
        assert!(transport.is_closed());
    }
}
