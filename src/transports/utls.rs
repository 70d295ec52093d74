//! UTLS hybrid transport (C6, §4.5): `utls:<host>:<port>` resolves to local
//! IPC when a peer is co-resident on the same host, falling back to TLS
//! otherwise. Owns two sub-socket transports (`ux`, `tls`) and composes their
//! event fds via [`EventFd::arm_nested`] so the whole thing still exposes a
//! single fd to the user (§4.5.6).

use crate::addr::parse_host_port_addr;
use crate::attr::{AttrSource, AttrValue};
use crate::error::{ErrorKind, XcmError};
use crate::event::EventFd;
use crate::registry;
use crate::transport::{Condition, Counters, SocketType, TransportOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubSocketKind {
    Ux,
    Tls,
}

impl SubSocketKind {
    fn name(self) -> &'static str {
        match self {
            SubSocketKind::Ux => "ux",
            SubSocketKind::Tls => "tls",
        }
    }
}

fn allocate_sub(kind: SubSocketKind, socket_type: SocketType) -> Result<Box<dyn TransportOps>, XcmError> {
    let factory = registry::by_name(kind.name()).ok_or_else(|| XcmError::ProtoNotAvailable(kind.name().to_string()))?;
    factory(socket_type)
}

/// Both sub-sockets still live, or a client connection has resolved onto one
/// of them. Servers stay in `Both` for their whole lifetime (§4.5.3/§4.5.4);
/// only connection sockets ever transition to `Resolved`.
enum Role {
    Both { ux: Box<dyn TransportOps>, tls: Box<dyn TransportOps> },
    Resolved { active: Box<dyn TransportOps>, kind: SubSocketKind },
}

pub struct UtlsTransport {
    role: Role,
    socket_type: SocketType,
    event_fd: EventFd,
    /// The host component the caller bound with, e.g. `"127.0.0.1"` or
    /// `"*"`. Kept verbatim so `get_local_addr` reports the same host the
    /// `ux` sub-socket was actually derived from -- the `tls` sub-socket's
    /// own local address may normalize it (e.g. to `0.0.0.0`).
    bound_host: Option<String>,
}

impl UtlsTransport {
    pub fn new(socket_type: SocketType) -> Result<Box<dyn TransportOps>, XcmError> {
        let event_fd = EventFd::new()?;
        let ux = allocate_sub(SubSocketKind::Ux, socket_type)?;
        let tls = allocate_sub(SubSocketKind::Tls, socket_type)?;
        event_fd.arm_nested(ux.event_fd(), ux.event_fd().as_raw_fd())?;
        event_fd.arm_nested(tls.event_fd(), tls.event_fd().as_raw_fd())?;
        Ok(Box::new(Self { role: Role::Both { ux, tls }, socket_type, event_fd, bound_host: None }))
    }

    fn resolved(active: Box<dyn TransportOps>, kind: SubSocketKind) -> Result<Self, XcmError> {
        let event_fd = EventFd::new()?;
        event_fd.arm_nested(active.event_fd(), active.event_fd().as_raw_fd())?;
        Ok(Self { role: Role::Resolved { active, kind }, socket_type: SocketType::Connection, event_fd, bound_host: None })
    }

    fn active(&self) -> Result<&dyn TransportOps, XcmError> {
        match &self.role {
            Role::Resolved { active, .. } => Ok(active.as_ref()),
            Role::Both { .. } => Err(XcmError::Protocol("utls connection not yet resolved".into())),
        }
    }

    fn active_mut(&mut self) -> Result<&mut Box<dyn TransportOps>, XcmError> {
        match &mut self.role {
            Role::Resolved { active, .. } => Ok(active),
            Role::Both { .. } => Err(XcmError::Protocol("utls connection not yet resolved".into())),
        }
    }

    /// The proxy table (§4.5.10): which sub-socket owns each attribute name.
    /// Rust trait objects have no pointer arithmetic back to an owning
    /// array, so each name is tagged with an explicit source instead of a
    /// byte offset.
    fn proxy_table(&self) -> Vec<(String, SubSocketKind)> {
        match &self.role {
            Role::Resolved { active, kind } => {
                active.attr_names().into_iter().map(|n| (n, *kind)).collect()
            }
            Role::Both { ux, tls } => ux
                .attr_names()
                .into_iter()
                .map(|n| (n, SubSocketKind::Ux))
                .chain(tls.attr_names().into_iter().map(|n| (n, SubSocketKind::Tls)))
                .collect(),
        }
    }

    fn sub(&self, kind: SubSocketKind) -> &dyn TransportOps {
        match &self.role {
            Role::Resolved { active, .. } => active.as_ref(),
            Role::Both { ux, tls } => match kind {
                SubSocketKind::Ux => ux.as_ref(),
                SubSocketKind::Tls => tls.as_ref(),
            },
        }
    }

    fn sub_mut(&mut self, kind: SubSocketKind) -> &mut Box<dyn TransportOps> {
        match &mut self.role {
            Role::Resolved { active, .. } => active,
            Role::Both { ux, tls } => match kind {
                SubSocketKind::Ux => ux,
                SubSocketKind::Tls => tls,
            },
        }
    }
}

impl TransportOps for UtlsTransport {
    fn transport_name(&self) -> &'static str {
        "utls"
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    fn event_fd(&self) -> &EventFd {
        &self.event_fd
    }

    fn connect(&mut self, addr: &str) -> Result<(), XcmError> {
        let (_proto, hp) = parse_host_port_addr(addr)?;
        let Role::Both { mut ux, tls } = std::mem::replace(
            &mut self.role,
            Role::Both { ux: allocate_sub(SubSocketKind::Ux, SocketType::Connection)?, tls: allocate_sub(SubSocketKind::Tls, SocketType::Connection)? },
        ) else {
            return Err(XcmError::Protocol("connect called twice on a utls connection socket".into()));
        };

        match ux.connect(&hp.to_ux_addr()) {
            Ok(()) => {
                let resolved = Self::resolved(ux, SubSocketKind::Ux)?;
                drop(tls);
                *self = resolved;
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {}
            Err(e) => return Err(e),
        }

        let mut tls = tls;
        tls.connect(&hp.to_tls_addr())?;
        drop(ux);
        *self = Self::resolved(tls, SubSocketKind::Tls)?;
        Ok(())
    }

    fn bind(&mut self, addr: &str) -> Result<(), XcmError> {
        let (_proto, hp) = parse_host_port_addr(addr)?;
        let Role::Both { mut ux, mut tls } = std::mem::replace(
            &mut self.role,
            Role::Both {
                ux: allocate_sub(SubSocketKind::Ux, SocketType::Server)?,
                tls: allocate_sub(SubSocketKind::Tls, SocketType::Server)?,
            },
        ) else {
            return Err(XcmError::Protocol("bind called twice on a utls server socket".into()));
        };

        // Bind the TLS side first so a `:0` port request resolves to a real
        // kernel-assigned port (§4.5.3); the ux side is then derived from it
        // so both sub-sockets answer on the same logical address.
        tls.bind(&hp.to_tls_addr())?;
        let resolved_port = match tls.get_local_addr()? {
            Some(local) => parse_host_port_addr(&local).map(|(_, local_hp)| local_hp.port).unwrap_or(hp.port),
            None => hp.port,
        };
        let ux_addr = crate::addr::HostPort { host: hp.host.clone(), port: resolved_port }.to_ux_addr();
        ux.bind(&ux_addr)?;

        self.role = Role::Both { ux, tls };
        self.bound_host = Some(hp.host);
        Ok(())
    }

    fn accept(&mut self) -> Result<Box<dyn TransportOps>, XcmError> {
        let Role::Both { ux, tls } = &mut self.role else {
            return Err(XcmError::Protocol("accept called on a resolved utls connection".into()));
        };
        if let Ok(conn) = ux.accept() {
            return Ok(Box::new(Self::resolved(conn, SubSocketKind::Ux)?));
        }
        let conn = tls.accept()?;
        Ok(Box::new(Self::resolved(conn, SubSocketKind::Tls)?))
    }

    fn send(&mut self, msg: &[u8]) -> Result<(), XcmError> {
        self.active_mut()?.send(msg)
    }

    fn receive(&mut self) -> Result<Vec<u8>, XcmError> {
        self.active_mut()?.receive()
    }

    fn finish(&mut self) -> Result<(), XcmError> {
        match &mut self.role {
            Role::Resolved { active, .. } => active.finish(),
            Role::Both { ux, tls } => {
                ux.finish()?;
                tls.finish()
            }
        }
    }

    fn update(&mut self, desired: Condition) -> Result<(), XcmError> {
        match &mut self.role {
            Role::Resolved { active, .. } => active.update(desired),
            Role::Both { ux, tls } => {
                ux.update(desired)?;
                tls.update(desired)
            }
        }
    }

    fn get_transport(&self) -> Option<&str> {
        match &self.role {
            Role::Resolved { active, .. } => Some(active.get_transport().unwrap_or(active.transport_name())),
            Role::Both { .. } => Some("utls"),
        }
    }

    fn get_local_addr(&self) -> Result<Option<String>, XcmError> {
        match &self.role {
            Role::Resolved { active, .. } => active.get_local_addr(),
            Role::Both { tls, .. } => match tls.get_local_addr()? {
                Some(local) => {
                    let (_, tls_hp) = parse_host_port_addr(&local)?;
                    let host = self.bound_host.clone().unwrap_or(tls_hp.host);
                    Ok(Some(crate::addr::HostPort { host, port: tls_hp.port }.to_utls_addr()))
                }
                None => Ok(None),
            },
        }
    }

    fn set_local_addr(&mut self, addr: &str) -> Result<(), XcmError> {
        let (_, hp) = parse_host_port_addr(addr)?;
        match &mut self.role {
            Role::Both { tls, .. } => tls.set_local_addr(&hp.to_tls_addr()),
            Role::Resolved { .. } => Err(XcmError::Permission("utls local address can only be set pre-bind".into())),
        }
    }

    fn get_remote_addr(&self) -> Result<Option<String>, XcmError> {
        match self.active() {
            Ok(active) => active.get_remote_addr(),
            Err(_) => Ok(None),
        }
    }

    fn max_msg_size(&self) -> usize {
        match &self.role {
            Role::Resolved { active, .. } => active.max_msg_size(),
            Role::Both { .. } => 256 * 1024,
        }
    }

    fn get_cnt(&self) -> Option<Counters> {
        self.active().ok().and_then(|a| a.get_cnt())
    }
}

impl AttrSource for UtlsTransport {
    fn attr_names(&self) -> Vec<String> {
        self.proxy_table().into_iter().map(|(name, _)| name).collect()
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError> {
        let (_, source) = self
            .proxy_table()
            .into_iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| XcmError::Protocol(format!("utls has no attribute {name}")))?;
        self.sub(source).get_attr(name)
    }

    fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<(), XcmError> {
        let (_, source) = self
            .proxy_table()
            .into_iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| XcmError::Permission(format!("utls has no attribute {name}")))?;
        self.sub_mut(source).set_attr(name, value)
    }
}
