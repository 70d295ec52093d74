//! Transport Registry (C1): a process-wide table mapping transport name to
//! its factory, populated once at startup by each built-in transport module.

use std::sync::{OnceLock, RwLock};

use crate::addr::{split_proto, MAX_PROTO_LEN};
use crate::error::XcmError;
use crate::transport::TransportFactory;

struct Descriptor {
    name: &'static str,
    factory: TransportFactory,
}

/// Fixed small capacity, at least the number of built-in transports
/// (§4.1: "a fixed small bound").
const REGISTRY_CAPACITY: usize = 8;

fn registry() -> &'static RwLock<Vec<Descriptor>> {
    static REGISTRY: OnceLock<RwLock<Vec<Descriptor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Vec::with_capacity(REGISTRY_CAPACITY)))
}

/// Registers a transport under `name`. Idempotent: registering the same
/// name twice with the same factory pointer is a silent no-op; registering
/// a *different* factory under an already-used name is rejected, matching
/// "rejects duplicates".
pub fn register(name: &'static str, factory: TransportFactory) -> Result<(), XcmError> {
    if name.is_empty() || name.len() > MAX_PROTO_LEN {
        return Err(XcmError::Protocol(format!(
            "transport name {name:?} exceeds the address-protocol maximum length"
        )));
    }
    let mut table = registry().write().expect("transport registry lock poisoned");
    if let Some(existing) = table.iter().find(|d| d.name == name) {
        if existing.factory as usize == factory as usize {
            return Ok(());
        }
        return Err(XcmError::Protocol(format!("transport {name:?} already registered")));
    }
    table.push(Descriptor { name, factory });
    Ok(())
}

/// Exact-name lookup (§4.1).
pub fn by_name(name: &str) -> Option<TransportFactory> {
    registry()
        .read()
        .expect("transport registry lock poisoned")
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.factory)
}

/// Resolves the transport for a user address by its leading `proto:` token
/// (§4.1). Unknown protocol -> `ProtoNotAvailable`.
pub fn by_address(addr: &str) -> Result<TransportFactory, XcmError> {
    let (proto, _rest) = split_proto(addr)?;
    by_name(proto).ok_or_else(|| XcmError::ProtoNotAvailable(proto.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SocketType, TransportOps};

    fn dummy_factory(_t: SocketType) -> Result<Box<dyn TransportOps>, XcmError> {
        unreachable!("not invoked by these tests")
    }

    #[test]
    fn register_then_by_name_round_trips() {
        register("test-dummy-a", dummy_factory).unwrap();
        assert!(by_name("test-dummy-a").is_some());
        assert!(by_name("test-dummy-nonexistent").is_none());
    }

    #[test]
    fn re_registering_same_factory_is_idempotent() {
        register("test-dummy-b", dummy_factory).unwrap();
        register("test-dummy-b", dummy_factory).unwrap();
    }

    #[test]
    fn by_address_extracts_proto_and_resolves() {
        register("test-dummy-c", dummy_factory).unwrap();
        assert!(by_address("test-dummy-c:rest-of-address").is_ok());
    }

    #[test]
    fn by_address_unknown_proto_is_not_available() {
        let err = by_address("nonexistent-proto:whatever").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtoNotAvailable);
    }

    #[test]
    fn name_exceeding_max_len_is_rejected() {
        let long: &'static str = "this-name-is-definitely-too-long-for-the-registry";
        assert!(register(long, dummy_factory).is_err());
    }
}
