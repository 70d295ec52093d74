//! End-to-end scenarios for the control/introspection channel (CTL).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use xcm::ctl::protocol::{Request, Response};

fn ctl_path(socket: &xcm::Socket) -> PathBuf {
    let dir = std::env::var("XCM_CTL").expect("test must set XCM_CTL before enabling control");
    PathBuf::from(dir).join(format!("{}.{}", std::process::id(), socket.id()))
}

/// Writes `req` and then drives `owner`'s background processing (accept,
/// recv-step, send-step are each gated by the CTL tick threshold) until a
/// full response shows up, or gives up after a generous number of attempts.
fn request_via_ctl(owner: &mut xcm::Socket, stream: &mut UnixStream, req: &Request) -> Response {
    stream.set_nonblocking(true).unwrap();
    stream.write_all(&req.encode().unwrap()).unwrap();

    let mut buf = [0u8; 4096];
    for _ in 0..2000 {
        owner.finish().ok();
        match stream.read(&mut buf) {
            Ok(n) if n > 0 => return Response::decode(&buf[..n]).unwrap(),
            _ => thread::sleep(Duration::from_millis(2)),
        }
    }
    panic!("CTL server never answered the request");
}

fn settle() {
    thread::sleep(Duration::from_millis(30));
}

/// Scenario 4: a CTL client's `GET_ALL_ATTR_REQ` on an active connection
/// returns at least the common and counter attributes.
#[test]
fn ctl_get_all_reports_type_transport_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("XCM_CTL", dir.path());

    let name = format!("xcm-ctl-test-{}", std::process::id());
    let mut server = xcm::server(&format!("ux:{name}")).unwrap();
    server.set_attr(xcm::attr::names::BLOCKING, &xcm::AttrValue::Bool(false)).unwrap();
    let mut client = xcm::connect(&format!("ux:{name}")).unwrap();
    client.set_attr(xcm::attr::names::BLOCKING, &xcm::AttrValue::Bool(false)).unwrap();

    settle();
    let mut accepted = server.accept().unwrap();
    accepted.enable_control().unwrap();

    for _ in 0..50 {
        if client.send(b"hi").is_ok() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    settle();
    accepted.receive().unwrap();

    let path = ctl_path(&accepted);
    let mut ctl_stream = UnixStream::connect(&path).unwrap();

    let resp = request_via_ctl(&mut accepted, &mut ctl_stream, &Request::GetAllAttr);
    let Response::GetAllAttrCfm(attrs) = resp else { panic!("expected GetAllAttrCfm, got {resp:?}") };

    let has = |n: &str| attrs.iter().any(|a| a.name == n);
    assert!(has(xcm::attr::names::TYPE));
    assert!(has(xcm::attr::names::TRANSPORT));
    for counter in xcm::attr::names::COUNTERS {
        assert!(has(counter), "missing counter attribute {counter}");
    }

    client.close();
    accepted.close();
    server.close();
}

/// Scenario 6: a CTL client that connects and never reads does not stall the
/// owner's own send/receive traffic.
#[test]
fn blocked_ctl_client_does_not_stall_user_traffic() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("XCM_CTL", dir.path());

    let name = format!("xcm-ctl-test-blocked-{}", std::process::id());
    let mut server = xcm::server(&format!("ux:{name}")).unwrap();
    server.set_attr(xcm::attr::names::BLOCKING, &xcm::AttrValue::Bool(false)).unwrap();
    let mut client = xcm::connect(&format!("ux:{name}")).unwrap();
    client.set_attr(xcm::attr::names::BLOCKING, &xcm::AttrValue::Bool(false)).unwrap();

    settle();
    let mut accepted = server.accept().unwrap();
    accepted.enable_control().unwrap();

    // Accept a CTL client, then never read or write on it -- it should sit
    // in RECV forever without affecting ordinary traffic below.
    let path = ctl_path(&accepted);
    let _silent_client = UnixStream::connect(&path).unwrap();

    for i in 0..200u32 {
        let msg = i.to_le_bytes();
        loop {
            accepted.finish().ok();
            if client.send(&msg).is_ok() {
                break;
            }
        }
        loop {
            accepted.finish().ok();
            match accepted.receive() {
                Ok(got) => {
                    assert_eq!(got, msg);
                    break;
                }
                Err(e) if e.is_would_block() => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    client.close();
    accepted.close();
    server.close();
}
