//! Framed TCP transport (§2b): `socket2`-constructed listeners/streams,
//! length-prefixed framing via [`super::framing::Framed`].

use std::net::{SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Socket, Type};

use crate::addr::parse_host_port_addr;
use crate::attr::{AttrSource, AttrValue};
use crate::error::XcmError;
use crate::event::{EventFd, Interest};
use crate::transport::{Condition, Counters, SocketType, TransportOps};

use super::framing::Framed;

const MAX_MSG_SIZE: usize = 256 * 1024;
const LISTEN_BACKLOG: i32 = 128;

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr, XcmError> {
    use std::net::ToSocketAddrs;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()
        .map_err(|e| XcmError::AddrParse(e.to_string()))?
        .next()
        .ok_or_else(|| XcmError::AddrParse(format!("{host}:{port}")))
}

fn listener_bind(addr: SocketAddr) -> Result<TcpListener, XcmError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn stream_connect(addr: SocketAddr) -> Result<TcpStream, XcmError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc_einprogress()) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(socket.into())
}

/// `EINPROGRESS`'s numeric value, without pulling in `libc` directly for one
/// constant (`socket2`/`nix` both re-export `ErrorKind::WouldBlock` for this
/// on the `std::io::Error` path already; this covers the raw-errno path some
/// platforms take for a non-blocking connect).
fn libc_einprogress() -> i32 {
    nix::errno::Errno::EINPROGRESS as i32
}

enum Role {
    Listener(TcpListener),
    Connection(Framed<TcpStream>),
}

pub struct TcpTransport {
    role: Option<Role>,
    socket_type: SocketType,
    event_fd: EventFd,
    counters: Counters,
}

impl TcpTransport {
    pub fn new(socket_type: SocketType) -> Result<Box<dyn TransportOps>, XcmError> {
        Ok(Box::new(Self {
            role: None,
            socket_type,
            event_fd: EventFd::new()?,
            counters: Counters::default(),
        }))
    }

    fn arm_current(&self) -> Result<(), XcmError> {
        match &self.role {
            Some(Role::Listener(l)) => {
                use std::os::fd::AsFd;
                self.event_fd.arm(l.as_fd(), l.as_fd().try_raw(), Interest::READ)
            }
            Some(Role::Connection(f)) => {
                use std::os::fd::AsFd;
                let want_write = f.has_pending_write();
                self.event_fd.arm(
                    f.inner().as_fd(),
                    f.inner().as_fd().try_raw(),
                    if want_write { Interest::BOTH } else { Interest::READ },
                )
            }
            None => Ok(()),
        }
    }
}

trait TryRaw {
    fn try_raw(&self) -> std::os::fd::RawFd;
}
impl TryRaw for std::os::fd::BorrowedFd<'_> {
    fn try_raw(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}

impl TransportOps for TcpTransport {
    fn transport_name(&self) -> &'static str {
        "tcp"
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    fn event_fd(&self) -> &EventFd {
        &self.event_fd
    }

    fn connect(&mut self, addr: &str) -> Result<(), XcmError> {
        let (_proto, hp) = parse_host_port_addr(addr)?;
        let sockaddr = resolve_one(&hp.host, hp.port)?;
        let stream = stream_connect(sockaddr)?;
        self.role = Some(Role::Connection(Framed::new(stream, MAX_MSG_SIZE)));
        self.arm_current()
    }

    fn bind(&mut self, addr: &str) -> Result<(), XcmError> {
        let (_proto, hp) = parse_host_port_addr(addr)?;
        let sockaddr = resolve_one(&hp.host, hp.port)?;
        let listener = listener_bind(sockaddr)?;
        self.role = Some(Role::Listener(listener));
        self.arm_current()
    }

    fn accept(&mut self) -> Result<Box<dyn TransportOps>, XcmError> {
        let Some(Role::Listener(listener)) = &self.role else {
            return Err(XcmError::Protocol("accept called on a non-listening tcp socket".into()));
        };
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                let mut conn = Self {
                    role: Some(Role::Connection(Framed::new(stream, MAX_MSG_SIZE))),
                    socket_type: SocketType::Connection,
                    event_fd: EventFd::new()?,
                    counters: Counters::default(),
                };
                conn.arm_current()?;
                Ok(Box::new(conn))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(XcmError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, msg: &[u8]) -> Result<(), XcmError> {
        let Some(Role::Connection(framed)) = &mut self.role else {
            return Err(XcmError::Protocol("send called on a non-connection tcp socket".into()));
        };
        framed.send(msg)?;
        self.counters.record_send(msg.len());
        self.arm_current()
    }

    fn receive(&mut self) -> Result<Vec<u8>, XcmError> {
        let Some(Role::Connection(framed)) = &mut self.role else {
            return Err(XcmError::Protocol("receive called on a non-connection tcp socket".into()));
        };
        let msg = framed.receive()?;
        self.counters.record_receive(msg.len());
        self.arm_current()?;
        Ok(msg)
    }

    fn finish(&mut self) -> Result<(), XcmError> {
        if let Some(Role::Connection(framed)) = &mut self.role {
            framed.try_flush()?;
        }
        self.arm_current()
    }

    fn update(&mut self, _desired: Condition) -> Result<(), XcmError> {
        self.arm_current()
    }

    fn get_local_addr(&self) -> Result<Option<String>, XcmError> {
        let addr = match &self.role {
            Some(Role::Listener(l)) => l.local_addr().ok(),
            Some(Role::Connection(f)) => f.inner().local_addr().ok(),
            None => None,
        };
        Ok(addr.map(|a| format!("tcp:{}:{}", a.ip(), a.port())))
    }

    fn get_remote_addr(&self) -> Result<Option<String>, XcmError> {
        Ok(match &self.role {
            Some(Role::Connection(f)) => {
                f.inner().peer_addr().ok().map(|a| format!("tcp:{}:{}", a.ip(), a.port()))
            }
            _ => None,
        })
    }

    fn max_msg_size(&self) -> usize {
        MAX_MSG_SIZE
    }

    fn get_cnt(&self) -> Option<Counters> {
        Some(self.counters)
    }
}

impl AttrSource for TcpTransport {
    fn attr_names(&self) -> Vec<String> {
        vec![]
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError> {
        Err(XcmError::Protocol(format!("tcp has no attribute {name}")))
    }

    fn set_attr(&mut self, name: &str, _value: &AttrValue) -> Result<(), XcmError> {
        Err(XcmError::Permission(format!("tcp has no attribute {name}")))
    }
}

/// Used by transports layered on top of a bound TCP socket (TLS, UTLS) that
/// need the kernel-assigned port after a `:0` bind (§4.5.3).
pub fn local_port(listener: &TcpListener) -> Result<u16, XcmError> {
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_port_zero_then_connect_and_exchange_a_message() {
        let mut server = TcpTransport::new(SocketType::Server).unwrap();
        server.bind("tcp:127.0.0.1:0").unwrap();
        let Some(Role::Listener(listener)) = &server.role else { unreachable!() };
        let port = local_port(listener).unwrap();
        assert_ne!(port, 0);

        let mut client = TcpTransport::new(SocketType::Connection).unwrap();
        client.connect(&format!("tcp:127.0.0.1:{port}")).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut accepted = server.accept().unwrap();

        for _ in 0..50 {
            if client.send(b"hi").is_ok() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(accepted.receive().unwrap(), b"hi");
    }
}
