//! Per-client state machine (§4.4): `RECV` -> `SEND` -> `RECV` -> ... until
//! an error or clean disconnect drops the slot to `DEAD`.

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::attr::AttrSource;
use crate::ctl::protocol::{Request, Response, WireAttr};
use crate::error::XcmError;
use crate::event::{EventFd, Interest};

/// Maximum size of a single CTL wire record; requests/responses are read
/// and written as one `recv`/`send` each, matching the "message-preserving
/// local-IPC socket" framing (§4.4) -- no length prefix needed since the
/// underlying `ux` transport already preserves datagram-like boundaries for
/// `SOCK_SEQPACKET`-equivalent streams used here.
const MAX_RECORD_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Recv,
    Send,
    Dead,
}

pub struct ClientSlot {
    stream: UnixStream,
    state: SlotState,
    pending_response: Vec<u8>,
    written: usize,
}

impl ClientSlot {
    pub fn new(stream: UnixStream) -> Result<Self, XcmError> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            state: SlotState::Recv,
            pending_response: Vec::new(),
            written: 0,
        })
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// The epoll interest this slot currently wants, per its state (§4.4).
    pub fn interest(&self) -> Interest {
        match self.state {
            SlotState::Recv => Interest::READ,
            SlotState::Send => Interest::WRITE,
            SlotState::Dead => Interest::NONE,
        }
    }

    pub fn arm(&self, events: &EventFd) -> Result<(), XcmError> {
        events.arm(self.as_fd(), self.raw_fd(), self.interest())
    }

    /// Advances this slot's state machine exactly one step, computing the
    /// response against `source` (the attributes of the socket this CTL
    /// listener belongs to) when a request completes.
    pub fn step(&mut self, source: &dyn AttrSource) {
        match self.state {
            SlotState::Recv => self.step_recv(source),
            SlotState::Send => self.step_send(),
            SlotState::Dead => {}
        }
    }

    fn step_recv(&mut self, source: &dyn AttrSource) {
        let mut buf = [0u8; MAX_RECORD_LEN];
        match self.stream.read(&mut buf) {
            Ok(0) => self.state = SlotState::Dead, // peer disconnected cleanly
            Ok(n) => match Request::decode(&buf[..n]).and_then(|req| handle_request(req, source)) {
                Ok(response) => match response.encode() {
                    Ok(bytes) => {
                        self.pending_response = bytes;
                        self.written = 0;
                        self.state = SlotState::Send;
                    }
                    Err(_) => self.state = SlotState::Dead,
                },
                Err(_) => self.state = SlotState::Dead,
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => self.state = SlotState::Dead,
        }
    }

    fn step_send(&mut self) {
        loop {
            if self.written == self.pending_response.len() {
                self.pending_response.clear();
                self.written = 0;
                self.state = SlotState::Recv;
                return;
            }
            match self.stream.write(&self.pending_response[self.written..]) {
                Ok(0) => {
                    self.state = SlotState::Dead;
                    return;
                }
                Ok(n) => self.written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return, // stay in SEND
                Err(_) => {
                    self.state = SlotState::Dead;
                    return;
                }
            }
        }
    }
}

fn handle_request(req: Request, source: &dyn AttrSource) -> Result<Response, XcmError> {
    match req {
        Request::GetAttr { name } => match source.get_attr(&name) {
            Ok(value) => Ok(Response::GetAttrCfm(WireAttr { name, value })),
            Err(e) => Ok(Response::GetAttrRej { errno: errno_for(&e) }),
        },
        Request::GetAllAttr => {
            let attrs = source
                .attr_names()
                .into_iter()
                .filter_map(|name| {
                    source.get_attr(&name).ok().map(|value| WireAttr { name, value })
                })
                .take(crate::ctl::protocol::MAX_ATTRS)
                .collect();
            Ok(Response::GetAllAttrCfm(attrs))
        }
    }
}

fn errno_for(e: &XcmError) -> u8 {
    e.kind() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrValue;

    struct Fake;
    impl AttrSource for Fake {
        fn attr_names(&self) -> Vec<String> {
            vec!["xcm.type".to_string()]
        }
        fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError> {
            if name == "xcm.type" {
                Ok(AttrValue::Str("connection".to_string()))
            } else {
                Err(XcmError::Protocol("no such attribute".into()))
            }
        }
        fn set_attr(&mut self, _name: &str, _value: &AttrValue) -> Result<(), XcmError> {
            unreachable!()
        }
    }

    #[test]
    fn recv_then_send_round_trip_get_attr() {
        let (client, server) = UnixStream::pair().unwrap();
        client.set_nonblocking(true).unwrap();
        let mut slot = ClientSlot::new(server).unwrap();
        assert_eq!(slot.state(), SlotState::Recv);

        let req = Request::GetAttr { name: "xcm.type".to_string() };
        let mut c = &client;
        c.write_all(&req.encode().unwrap()).unwrap();

        slot.step(&Fake);
        assert_eq!(slot.state(), SlotState::Send);

        slot.step(&Fake);
        assert_eq!(slot.state(), SlotState::Recv);

        let mut buf = [0u8; 256];
        let n = c.read(&mut buf).unwrap();
        let resp = Response::decode(&buf[..n]).unwrap();
        assert_eq!(
            resp,
            Response::GetAttrCfm(WireAttr {
                name: "xcm.type".to_string(),
                value: AttrValue::Str("connection".to_string())
            })
        );
    }

    #[test]
    fn peer_disconnect_drops_to_dead() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut slot = ClientSlot::new(server).unwrap();
        drop(client);
        slot.step(&Fake);
        assert_eq!(slot.state(), SlotState::Dead);
    }

    #[test]
    fn garbage_bytes_drop_to_dead_not_panic() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut slot = ClientSlot::new(server).unwrap();
        let mut c = &client;
        c.write_all(&[0xffu8; 8]).unwrap();
        slot.step(&Fake);
        assert_eq!(slot.state(), SlotState::Dead);
    }

    #[test]
    fn would_block_recv_stays_in_recv() {
        let (_client, server) = UnixStream::pair().unwrap();
        let mut slot = ClientSlot::new(server).unwrap();
        slot.step(&Fake);
        assert_eq!(slot.state(), SlotState::Recv);
    }
}
