//! The four built-in transport backends (§2b, §4.5) plus their shared framing
//! helper. Each submodule registers itself with [`crate::registry`] under its
//! address-protocol name; `register_builtin_transports` does this once,
//! lazily, so the registry is populated before any `connect`/`server` call
//! needs to resolve a protocol.

mod framing;
mod tcp;
mod tls;
mod ux;
mod utls;

use std::sync::Once;

use crate::registry;

fn to_ux(t: crate::transport::SocketType) -> Result<Box<dyn crate::transport::TransportOps>, crate::error::XcmError> {
    ux::UxTransport::new(t)
}

fn to_tcp(t: crate::transport::SocketType) -> Result<Box<dyn crate::transport::TransportOps>, crate::error::XcmError> {
    tcp::TcpTransport::new(t)
}

fn to_tls(t: crate::transport::SocketType) -> Result<Box<dyn crate::transport::TransportOps>, crate::error::XcmError> {
    tls::TlsTransport::new(t)
}

fn to_utls(t: crate::transport::SocketType) -> Result<Box<dyn crate::transport::TransportOps>, crate::error::XcmError> {
    utls::UtlsTransport::new(t)
}

/// Registers `ux`, `uxf`, `tcp`, `tls`, and `utls`. Idempotent and cheap to
/// call from every public entry point (§4.1's registry is itself idempotent
/// on duplicate registration of the same factory).
pub fn register_builtin_transports() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        registry::register("ux", to_ux).expect("built-in transport registration cannot fail");
        registry::register("uxf", to_ux).expect("built-in transport registration cannot fail");
        registry::register("tcp", to_tcp).expect("built-in transport registration cannot fail");
        registry::register("tls", to_tls).expect("built-in transport registration cannot fail");
        registry::register("utls", to_utls).expect("built-in transport registration cannot fail");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_builtin_transports_populates_all_five_protocols() {
        register_builtin_transports();
        for proto in ["ux", "uxf", "tcp", "tls", "utls"] {
            assert!(registry::by_name(proto).is_some(), "{proto} not registered");
        }
    }
}
