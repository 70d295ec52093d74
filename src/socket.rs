//! Socket Core & Dispatch (C2, C3): the owning record behind every public
//! handle, and the operation skeleton every call goes through.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{instrument, trace};

use crate::attr::{names, AttrSource, AttrValue};
use crate::ctl::CtlState;
use crate::error::XcmError;
use crate::event::EventFd;
use crate::transport::{Condition, Counters, SocketType, TransportOps};

fn next_socket_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The owning record behind every socket handle the public API returns.
/// Holds the transport vtable, the shared event fd, the desired-condition
/// hint, and (lazily) the control channel.
pub struct SocketCore {
    id: u64,
    transport: Box<dyn TransportOps>,
    blocking: bool,
    desired: Condition,
    ctl: Option<CtlState>,
}

impl SocketCore {
    pub fn new(transport: Box<dyn TransportOps>) -> Self {
        Self {
            id: next_socket_id(),
            transport,
            blocking: true,
            desired: Condition::NONE,
            ctl: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn socket_type(&self) -> SocketType {
        self.transport.socket_type()
    }

    pub fn event_fd(&self) -> &EventFd {
        self.transport.event_fd()
    }

    fn service_ctl(&mut self) {
        let transport = self.transport.as_ref();
        let view = CommonAttrs { transport, blocking: self.blocking };
        if let Some(ctl) = self.ctl.as_mut() {
            ctl.ctl_process(transport.event_fd(), &view);
        }
    }

    /// Step 3 of the C2/C3 skeleton (§4.2): re-invoke `update` so the
    /// transport reprograms its event-fd registration after an op that may
    /// have changed readiness.
    fn resync_update(&mut self) -> Result<(), XcmError> {
        self.transport.update(self.desired)
    }

    #[instrument(level = "trace", skip(self), fields(socket = self.id))]
    pub fn connect(&mut self, addr: &str) -> Result<(), XcmError> {
        self.service_ctl();
        self.transport.connect(addr)?;
        self.resync_update()
    }

    #[instrument(level = "trace", skip(self), fields(socket = self.id))]
    pub fn bind(&mut self, addr: &str) -> Result<(), XcmError> {
        self.service_ctl();
        self.transport.bind(addr)
    }

    #[instrument(level = "trace", skip(self), fields(socket = self.id))]
    pub fn accept(&mut self) -> Result<SocketCore, XcmError> {
        self.service_ctl();
        let transport = self.transport.accept()?;
        self.resync_update()?;
        Ok(SocketCore::new(transport))
    }

    #[instrument(level = "trace", skip(self, msg), fields(socket = self.id, len = msg.len()))]
    pub fn send(&mut self, msg: &[u8]) -> Result<(), XcmError> {
        self.service_ctl();
        self.transport.send(msg)?;
        self.resync_update()
    }

    #[instrument(level = "trace", skip(self), fields(socket = self.id))]
    pub fn receive(&mut self) -> Result<Vec<u8>, XcmError> {
        self.service_ctl();
        let msg = self.transport.receive()?;
        self.resync_update()?;
        Ok(msg)
    }

    #[instrument(level = "trace", skip(self), fields(socket = self.id))]
    pub fn finish(&mut self) -> Result<(), XcmError> {
        self.service_ctl();
        self.transport.finish()?;
        self.resync_update()
    }

    /// `update` does not service CTL or re-invoke itself (§4.2 step 1 "except
    /// for update and get_* which do not").
    pub fn update(&mut self, desired: Condition) -> Result<(), XcmError> {
        self.desired = desired;
        self.transport.update(desired)
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Lazily creates the control channel for this socket, if not already
    /// present. A no-op if CTL is disabled (missing control directory).
    pub fn enable_ctl(&mut self, pid: u32, costly_transport: bool) -> Result<(), XcmError> {
        if self.ctl.is_some() {
            return Ok(());
        }
        self.ctl = CtlState::create(pid, self.id, self.transport.event_fd(), costly_transport)?;
        Ok(())
    }

    /// `owner == true` (normal `close`) unlinks the CTL listener path;
    /// `owner == false` (`cleanup`, post-fork non-owner) only drops local
    /// state.
    pub fn close(mut self, owner: bool) {
        if let Some(ctl) = self.ctl.take() {
            ctl.destroy(owner);
        }
        trace!(socket = self.id, owner, "socket closed");
    }
}

impl AttrSource for SocketCore {
    /// §4.3: the common attributes present on every socket, connection-only
    /// attributes added when applicable, plus whatever the transport itself
    /// contributes.
    fn attr_names(&self) -> Vec<String> {
        common_attr_names(self.transport.as_ref())
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError> {
        common_get_attr(self.transport.as_ref(), self.blocking, name)
    }

    fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<(), XcmError> {
        match name {
            names::BLOCKING => {
                self.blocking = value.as_bool()?;
                Ok(())
            }
            names::LOCAL_ADDR => self.transport.set_local_addr(value.as_str()?),
            names::TYPE | names::TRANSPORT | names::REMOTE_ADDR | names::MAX_MSG_SIZE => {
                Err(XcmError::Permission(format!("{name} is read-only")))
            }
            n if names::COUNTERS.contains(&n) => Err(XcmError::Permission(format!("{name} is read-only"))),
            _ => self.transport.set_attr(name, value),
        }
    }
}

/// §4.3's common/connection-only attribute layer, factored out of
/// `SocketCore`'s own `AttrSource` impl so the control channel (which only
/// ever needs read access, and must be serviced without holding `self.ctl`
/// and `self` borrowed at once) can see the same attributes a user sees
/// through `Socket::get_attr`/`get_all_attrs` -- not just whatever the bare
/// transport contributes on its own.
struct CommonAttrs<'a> {
    transport: &'a dyn TransportOps,
    blocking: bool,
}

impl AttrSource for CommonAttrs<'_> {
    fn attr_names(&self) -> Vec<String> {
        common_attr_names(self.transport)
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError> {
        common_get_attr(self.transport, self.blocking, name)
    }

    fn set_attr(&mut self, _name: &str, _value: &AttrValue) -> Result<(), XcmError> {
        Err(XcmError::Permission("read-only attribute view".into()))
    }
}

fn common_attr_names(transport: &dyn TransportOps) -> Vec<String> {
    let mut names = vec![
        names::BLOCKING.to_string(),
        names::TYPE.to_string(),
        names::TRANSPORT.to_string(),
        names::LOCAL_ADDR.to_string(),
    ];
    if transport.socket_type() == SocketType::Connection {
        names.push(names::REMOTE_ADDR.to_string());
        names.push(names::MAX_MSG_SIZE.to_string());
        names.extend(names::COUNTERS.iter().map(|s| s.to_string()));
    }
    names.extend(transport.attr_names());
    names
}

fn common_get_attr(transport: &dyn TransportOps, blocking: bool, name: &str) -> Result<AttrValue, XcmError> {
    match name {
        names::BLOCKING => Ok(AttrValue::Bool(blocking)),
        names::TYPE => Ok(AttrValue::Str(transport.socket_type().as_str().to_string())),
        names::TRANSPORT => Ok(AttrValue::Str(
            transport.get_transport().unwrap_or(transport.transport_name()).to_string(),
        )),
        names::LOCAL_ADDR => match transport.get_local_addr()? {
            Some(addr) => Ok(AttrValue::Str(addr)),
            None => Err(XcmError::NotAvailable("no local address available".into())),
        },
        names::REMOTE_ADDR if transport.socket_type() == SocketType::Connection => {
            match transport.get_remote_addr()? {
                Some(addr) => Ok(AttrValue::Str(addr)),
                None => Err(XcmError::NotAvailable("no remote address available".into())),
            }
        }
        names::MAX_MSG_SIZE if transport.socket_type() == SocketType::Connection => {
            Ok(AttrValue::Int64(transport.max_msg_size() as i64))
        }
        n if transport.socket_type() == SocketType::Connection && names::COUNTERS.contains(&n) => {
            let c = transport.get_cnt().unwrap_or_default();
            Ok(AttrValue::Int64(counter_by_name(&c, n)))
        }
        _ => transport.get_attr(name),
    }
}

fn counter_by_name(c: &Counters, name: &str) -> i64 {
    (match name {
        names::CNT_TO_APP_MSGS => c.to_app_msgs,
        names::CNT_FROM_APP_MSGS => c.from_app_msgs,
        names::CNT_TO_LOWER_MSGS => c.to_lower_msgs,
        names::CNT_FROM_LOWER_MSGS => c.from_lower_msgs,
        names::CNT_TO_APP_BYTES => c.to_app_bytes,
        names::CNT_FROM_APP_BYTES => c.from_app_bytes,
        names::CNT_TO_LOWER_BYTES => c.to_lower_bytes,
        names::CNT_FROM_LOWER_BYTES => c.from_lower_bytes,
        _ => 0,
    }) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventFd;
    use crate::transport::Counters;

    struct FakeTransport {
        event_fd: EventFd,
        socket_type: SocketType,
    }

    impl AttrSource for FakeTransport {
        fn attr_names(&self) -> Vec<String> {
            vec![]
        }
        fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError> {
            Err(XcmError::Protocol(format!("unknown attribute {name}")))
        }
        fn set_attr(&mut self, name: &str, _value: &AttrValue) -> Result<(), XcmError> {
            Err(XcmError::Permission(name.to_string()))
        }
    }

    impl TransportOps for FakeTransport {
        fn transport_name(&self) -> &'static str {
            "fake"
        }
        fn socket_type(&self) -> SocketType {
            self.socket_type
        }
        fn event_fd(&self) -> &EventFd {
            &self.event_fd
        }
        fn connect(&mut self, _addr: &str) -> Result<(), XcmError> {
            Ok(())
        }
        fn bind(&mut self, _addr: &str) -> Result<(), XcmError> {
            Ok(())
        }
        fn accept(&mut self) -> Result<Box<dyn TransportOps>, XcmError> {
            Err(XcmError::WouldBlock)
        }
        fn send(&mut self, _msg: &[u8]) -> Result<(), XcmError> {
            Ok(())
        }
        fn receive(&mut self) -> Result<Vec<u8>, XcmError> {
            Ok(vec![])
        }
        fn finish(&mut self) -> Result<(), XcmError> {
            Ok(())
        }
        fn update(&mut self, _desired: Condition) -> Result<(), XcmError> {
            Ok(())
        }
        fn get_cnt(&self) -> Option<Counters> {
            Some(Counters { to_app_msgs: 3, ..Default::default() })
        }
    }

    fn fake_core(t: SocketType) -> SocketCore {
        SocketCore::new(Box::new(FakeTransport { event_fd: EventFd::new().unwrap(), socket_type: t }))
    }

    #[test]
    fn common_attrs_present_on_every_socket() {
        let core = fake_core(SocketType::Server);
        let names = core.attr_names();
        assert!(names.contains(&names::TYPE.to_string()));
        assert_eq!(core.get_attr(names::TYPE).unwrap().as_str().unwrap(), "server");
    }

    #[test]
    fn connection_only_attrs_absent_on_server() {
        let core = fake_core(SocketType::Server);
        assert!(core.get_attr(names::MAX_MSG_SIZE).is_err());
    }

    #[test]
    fn counter_attr_reads_through_transport_get_cnt() {
        let core = fake_core(SocketType::Connection);
        assert_eq!(core.get_attr(names::CNT_TO_APP_MSGS).unwrap().as_i64().unwrap(), 3);
    }

    #[test]
    fn blocking_attr_is_read_write() {
        let mut core = fake_core(SocketType::Connection);
        assert!(core.get_attr(names::BLOCKING).unwrap().as_bool().unwrap());
        core.set_attr(names::BLOCKING, &AttrValue::Bool(false)).unwrap();
        assert!(!core.is_blocking());
    }

    #[test]
    fn readonly_attrs_reject_set() {
        let mut core = fake_core(SocketType::Connection);
        assert!(core.set_attr(names::TYPE, &AttrValue::Str("x".into())).is_err());
        assert!(core.set_attr(names::CNT_TO_APP_MSGS, &AttrValue::Int64(1)).is_err());
    }

    #[test]
    fn common_attr_view_sees_type_transport_and_counters_not_just_transport_private() {
        // CommonAttrs is what the control channel is handed (src/ctl's
        // source), and it must expose the same layered attributes a user
        // sees through SocketCore's own AttrSource, not only whatever the
        // bare transport contributes on its own (which for most transports
        // is nothing).
        let transport = FakeTransport { event_fd: EventFd::new().unwrap(), socket_type: SocketType::Connection };
        let view = CommonAttrs { transport: &transport, blocking: true };
        assert!(view.attr_names().contains(&names::TYPE.to_string()));
        assert_eq!(view.get_attr(names::TYPE).unwrap().as_str().unwrap(), "connection");
        assert_eq!(view.get_attr(names::CNT_TO_APP_MSGS).unwrap().as_i64().unwrap(), 3);
    }

    #[test]
    fn missing_local_addr_is_not_available_not_protocol_error() {
        let core = fake_core(SocketType::Connection);
        let err = core.get_attr(names::LOCAL_ADDR).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotAvailable);
    }
}
