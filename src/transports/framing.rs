//! Length-prefixed message framing shared by `ux` and `tcp` (and, through
//! `tcp`, `tls`): a 4-byte little-endian length followed by the payload,
//! giving a byte stream message-preserving semantics.
//!
//! Sockets are non-blocking, so a single `read`/`write` call may only see
//! part of a frame. `Framed` buffers the remainder across calls rather than
//! looping until it would block, matching the rest of this crate's "one op,
//! one syscall attempt, WouldBlock on short progress" style.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use crate::error::XcmError;

const LEN_PREFIX: usize = 4;

pub struct Framed<S> {
    stream: S,
    max_msg_size: usize,
    read_buf: Vec<u8>,
    write_buf: VecDeque<u8>,
}

impl<S: Read + Write> Framed<S> {
    pub fn new(stream: S, max_msg_size: usize) -> Self {
        Self { stream, max_msg_size, read_buf: Vec::new(), write_buf: VecDeque::new() }
    }

    pub fn inner(&self) -> &S {
        &self.stream
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Queues `msg` for sending and attempts to flush as much as possible
    /// without blocking. Returns `Ok(())` even if some bytes remain queued;
    /// a later call (to `send` or `finish`) drains the rest.
    pub fn send(&mut self, msg: &[u8]) -> Result<(), XcmError> {
        if msg.len() > self.max_msg_size {
            return Err(XcmError::MessageTooLarge { size: msg.len(), max: self.max_msg_size });
        }
        self.write_buf.extend((msg.len() as u32).to_le_bytes());
        self.write_buf.extend(msg.iter().copied());
        self.try_flush()
    }

    /// Drains as much of the pending write queue as the socket accepts right
    /// now. Leaves the remainder queued on `WouldBlock`.
    pub fn try_flush(&mut self) -> Result<(), XcmError> {
        while !self.write_buf.is_empty() {
            let (front, _) = self.write_buf.as_slices();
            match self.stream.write(front) {
                Ok(0) => return Err(XcmError::Reset),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Attempts to complete exactly one message. `Err(WouldBlock)` if no full
    /// frame is available yet; short reads are absorbed into `read_buf`
    /// across calls.
    pub fn receive(&mut self) -> Result<Vec<u8>, XcmError> {
        if let Some(msg) = self.take_complete_frame()? {
            return Ok(msg);
        }
        let mut chunk = [0u8; 8192];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(XcmError::ClosedByPeer),
            Ok(n) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                self.take_complete_frame()?.ok_or(XcmError::WouldBlock)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(XcmError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn take_complete_frame(&mut self) -> Result<Option<Vec<u8>>, XcmError> {
        if self.read_buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_le_bytes(self.read_buf[..LEN_PREFIX].try_into().unwrap()) as usize;
        if len > self.max_msg_size {
            return Err(XcmError::MessageTooLarge { size: len, max: self.max_msg_size });
        }
        if self.read_buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let msg = self.read_buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.read_buf.drain(..LEN_PREFIX + len);
        Ok(Some(msg))
    }
}
