//! End-to-end scenarios for the UTLS hybrid transport.

use std::thread;
use std::time::Duration;

fn settle() {
    thread::sleep(Duration::from_millis(30));
}

/// Scenario 1: a server and client on the same host resolve a `utls:`
/// connection onto local IPC, not TLS.
#[test]
fn utls_local_wins_when_server_is_co_resident() {
    let mut server = xcm::server("utls:127.0.0.1:0").unwrap();
    server.set_attr(xcm::attr::names::BLOCKING, &xcm::AttrValue::Bool(false)).unwrap();
    let bound = server.get_attr(xcm::attr::names::LOCAL_ADDR).unwrap().as_str().unwrap().to_string();

    let mut client = xcm::connect(&bound).unwrap();
    client.set_attr(xcm::attr::names::BLOCKING, &xcm::AttrValue::Bool(false)).unwrap();

    assert_eq!(client.get_attr(xcm::attr::names::TRANSPORT).unwrap().as_str().unwrap(), "ux");

    settle();
    let mut accepted = server.accept().unwrap();
    assert_eq!(accepted.get_attr(xcm::attr::names::TRANSPORT).unwrap().as_str().unwrap(), "ux");

    for _ in 0..50 {
        if client.send(b"hello").is_ok() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    settle();
    assert_eq!(accepted.receive().unwrap(), b"hello");

    client.close();
    accepted.close();
    server.close();
}

/// Scenario 3: binding `utls:127.0.0.1:0` resolves the kernel-assigned port
/// through the TLS sub-socket, and the derived `ux` sub-server answers on
/// the same port component.
#[test]
fn port_zero_bind_resolves_and_a_later_client_connects_locally() {
    let mut server = xcm::server("utls:127.0.0.1:0").unwrap();
    let local = server.get_attr(xcm::attr::names::LOCAL_ADDR).unwrap().as_str().unwrap().to_string();
    assert!(local.starts_with("utls:127.0.0.1:"));
    let port: u16 = local.rsplit(':').next().unwrap().parse().unwrap();
    assert!(port > 0);

    let mut client = xcm::connect(&format!("utls:127.0.0.1:{port}")).unwrap();
    assert_eq!(client.get_attr(xcm::attr::names::TRANSPORT).unwrap().as_str().unwrap(), "ux");
    client.close();
    server.close();
}

/// Not covered here: scenario 2 (cross-host fallback) requires two distinct
/// hosts and is exercised instead at the `ux`/`tls` sub-transport level --
/// `utls::tests::utls_falls_back_to_tls_when_no_local_peer` in
/// `src/transports/utls.rs` covers the single-host analogue (no listener at
/// the derived `ux` name forces the TLS leg).
