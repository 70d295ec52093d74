//! The transport plugin contract (C1/C2's shared vocabulary): the vtable
//! every transport implements, and the small value types that vtable speaks
//! in terms of.

use crate::attr::AttrSource;
use crate::error::XcmError;
use crate::event::EventFd;

/// A socket's role. Immutable after creation (§3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Server,
    Connection,
}

impl SocketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketType::Server => "server",
            SocketType::Connection => "connection",
        }
    }
}

/// The desired-condition bitset (§5): what the user next intends to attempt.
/// Zero is legal ("only background progress").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Condition {
    pub readable: bool,
    pub writable: bool,
    pub acceptable: bool,
}

impl Condition {
    pub const NONE: Condition = Condition { readable: false, writable: false, acceptable: false };
    pub const READABLE: Condition = Condition { readable: true, writable: false, acceptable: false };
    pub const WRITABLE: Condition = Condition { readable: false, writable: true, acceptable: false };
    pub const ACCEPTABLE: Condition = Condition { readable: false, writable: false, acceptable: true };

    pub fn union(self, other: Condition) -> Condition {
        Condition {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
            acceptable: self.acceptable || other.acceptable,
        }
    }
}

/// The eight monotonically non-decreasing byte/message counters every
/// connection socket carries (§3, §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub to_app_msgs: u64,
    pub from_app_msgs: u64,
    pub to_lower_msgs: u64,
    pub from_lower_msgs: u64,
    pub to_app_bytes: u64,
    pub from_app_bytes: u64,
    pub to_lower_bytes: u64,
    pub from_lower_bytes: u64,
}

impl Counters {
    pub fn record_send(&mut self, bytes: usize) {
        self.from_app_msgs += 1;
        self.from_app_bytes += bytes as u64;
        self.to_lower_msgs += 1;
        self.to_lower_bytes += bytes as u64;
    }

    pub fn record_receive(&mut self, bytes: usize) {
        self.from_lower_msgs += 1;
        self.from_lower_bytes += bytes as u64;
        self.to_app_msgs += 1;
        self.to_app_bytes += bytes as u64;
    }
}

/// The polymorphic socket abstraction (§9): every transport implements this
/// trait once per concrete socket it creates. The framework in `socket.rs`
/// (C2/C3) never matches on transport identity; it only ever calls through
/// this trait object.
///
/// A `Box<dyn TransportOps>` is the Rust analogue of "vtable + inline
/// private-state tail": the trait object carries both the operations and
/// (inside the concrete type implementing it) the private state, without
/// the unsafe inline-byte-tail layout the spec's host language used.
pub trait TransportOps: AttrSource + Send {
    /// The transport name as it would be registered (§4.1). UTLS overrides
    /// `get_transport` below rather than this, since its *registered* name
    /// and its *reported* name diverge once a connection resolves (§4.2).
    fn transport_name(&self) -> &'static str;

    fn socket_type(&self) -> SocketType;

    /// The fd the framework hands to the user as this socket's event fd.
    fn event_fd(&self) -> &EventFd;

    fn connect(&mut self, addr: &str) -> Result<(), XcmError>;

    /// Binds as a server at `addr`. Only ever called once, right after
    /// construction.
    fn bind(&mut self, addr: &str) -> Result<(), XcmError>;

    /// Accepts one pending connection, returning a new connection-socket
    /// transport. `Err(WouldBlock)` if none is pending.
    fn accept(&mut self) -> Result<Box<dyn TransportOps>, XcmError>;

    fn send(&mut self, msg: &[u8]) -> Result<(), XcmError>;

    /// Receives one message, preserving the sender's message boundary.
    /// `Ok(vec![])` signals the peer closed the connection cleanly
    /// (`Closed-by-peer`, per §7, is raised instead when that actually
    /// breaks a subsequent op; an empty receive is itself a valid, distinct
    /// outcome some transports never produce).
    fn receive(&mut self) -> Result<Vec<u8>, XcmError>;

    /// Drives background work (handshake completion, buffered flush, CTL
    /// servicing upstream of this call) without attempting to send/receive
    /// application data.
    fn finish(&mut self) -> Result<(), XcmError>;

    /// Reprograms this socket's event-fd registration to reflect `desired`
    /// plus whatever internal background-progress conditions are pending.
    fn update(&mut self, desired: Condition) -> Result<(), XcmError>;

    /// §4.2: if a transport doesn't override this, the framework returns
    /// the registered transport name instead.
    fn get_transport(&self) -> Option<&str> {
        None
    }

    fn get_local_addr(&self) -> Result<Option<String>, XcmError> {
        Ok(None)
    }

    /// §4.2: optional; absent means "permission denied".
    fn set_local_addr(&mut self, _addr: &str) -> Result<(), XcmError> {
        Err(XcmError::Permission("set_local_addr not supported by this transport".into()))
    }

    fn get_remote_addr(&self) -> Result<Option<String>, XcmError> {
        Ok(None)
    }

    fn max_msg_size(&self) -> usize {
        // A generous default; concrete transports override with their real limit.
        256 * 1024
    }

    /// §4.2: optional; absent means the framework falls back to its own
    /// generic counters.
    fn get_cnt(&self) -> Option<Counters> {
        None
    }
}

/// Factory signature a transport registers under its name (§4.1): produces
/// a freshly-constructed, not-yet-connected/bound transport instance.
pub type TransportFactory = fn(SocketType) -> Result<Box<dyn TransportOps>, XcmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_union_is_commutative_on_bits() {
        let a = Condition::READABLE;
        let b = Condition::WRITABLE;
        let u = a.union(b);
        assert!(u.readable && u.writable && !u.acceptable);
    }

    #[test]
    fn counters_are_monotone_after_send_and_receive() {
        let mut c = Counters::default();
        c.record_send(5);
        c.record_receive(7);
        assert!(c.from_app_msgs >= c.to_lower_msgs);
        assert!(c.from_lower_msgs >= c.to_app_msgs);
    }
}
