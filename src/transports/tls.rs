//! Framed TLS transport (§2b): a `tcp` socket wrapped in a `rustls` session.
//! Certificate and key material are supplied via attributes, set before
//! `bind`/`connect` (§4.3's "attribute mode may depend on socket lifecycle").

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

use crate::addr::parse_host_port_addr;
use crate::attr::{AttrSource, AttrValue};
use crate::error::XcmError;
use crate::event::{EventFd, Interest};
use crate::transport::{Condition, Counters, SocketType, TransportOps};

use super::framing::Framed;
use super::tcp::local_port;

const MAX_MSG_SIZE: usize = 256 * 1024;
const LISTEN_BACKLOG: i32 = 128;

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, XcmError> {
    let file = File::open(path).map_err(XcmError::from)?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(XcmError::from)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, XcmError> {
    let file = File::open(path).map_err(XcmError::from)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(XcmError::from)?
        .ok_or_else(|| XcmError::Protocol(format!("no private key found in {path}")))
}

/// Accepts any server certificate without validation. Used only when the
/// caller has not supplied a CA certificate (§1: this transport ships a
/// minimal, not a hardened, TLS implementation).
#[derive(Debug)]
struct NoServerVerification;

impl rustls::client::danger::ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn build_server_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, XcmError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(XcmError::from)?;
    Ok(Arc::new(config))
}

fn build_client_config(cacert_path: Option<&str>) -> Result<Arc<ClientConfig>, XcmError> {
    let builder = ClientConfig::builder();
    let config = match cacert_path {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(path)? {
                roots.add(cert).map_err(XcmError::from)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification))
            .with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

enum TlsConn {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl TlsConn {
    fn is_handshaking(&self) -> bool {
        match self {
            TlsConn::Client(c) => c.is_handshaking(),
            TlsConn::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConn::Client(c) => c.wants_write(),
            TlsConn::Server(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, rd: &mut impl Read) -> io::Result<usize> {
        match self {
            TlsConn::Client(c) => c.read_tls(rd),
            TlsConn::Server(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut impl Write) -> io::Result<usize> {
        match self {
            TlsConn::Client(c) => c.write_tls(wr),
            TlsConn::Server(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<(), XcmError> {
        match self {
            TlsConn::Client(c) => c.process_new_packets().map(|_| ()).map_err(XcmError::from),
            TlsConn::Server(c) => c.process_new_packets().map(|_| ()).map_err(XcmError::from),
        }
    }
}

/// A TCP stream wrapped in a rustls session; implements `Read`/`Write` over
/// plaintext so [`Framed`] can treat it exactly like a `tcp` stream.
struct TlsStream {
    tcp: TcpStream,
    conn: TlsConn,
}

impl TlsStream {
    fn drive_io(&mut self) -> Result<(), XcmError> {
        loop {
            match self.conn.read_tls(&mut self.tcp) {
                Ok(0) => return Err(XcmError::ClosedByPeer),
                Ok(_) => self.conn.process_new_packets()?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.tcp) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.conn {
            TlsConn::Client(c) => c.reader().read(buf),
            TlsConn::Server(c) => c.reader().read(buf),
        };
        match n {
            Ok(n) if n > 0 => return Ok(n),
            Ok(_) | Err(_) => {}
        }
        self.drive_io().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        match &mut self.conn {
            TlsConn::Client(c) => c.reader().read(buf),
            TlsConn::Server(c) => c.reader().read(buf),
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.conn {
            TlsConn::Client(c) => c.writer().write(buf)?,
            TlsConn::Server(c) => c.writer().write(buf)?,
        };
        self.drive_io().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drive_io().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.tcp.flush()
    }
}

enum Role {
    Listener { tcp: std::net::TcpListener, config: Arc<ServerConfig> },
    Connection(Framed<TlsStream>),
}

pub struct TlsTransport {
    role: Option<Role>,
    socket_type: SocketType,
    event_fd: EventFd,
    counters: Counters,
    cert_path: Option<String>,
    key_path: Option<String>,
    cacert_path: Option<String>,
}

impl TlsTransport {
    pub fn new(socket_type: SocketType) -> Result<Box<dyn TransportOps>, XcmError> {
        Ok(Box::new(Self {
            role: None,
            socket_type,
            event_fd: EventFd::new()?,
            counters: Counters::default(),
            cert_path: None,
            key_path: None,
            cacert_path: None,
        }))
    }

    fn arm_current(&self) -> Result<(), XcmError> {
        use std::os::fd::{AsFd, AsRawFd};
        match &self.role {
            Some(Role::Listener { tcp, .. }) => {
                self.event_fd.arm(tcp.as_fd(), tcp.as_fd().as_raw_fd(), Interest::READ)
            }
            Some(Role::Connection(f)) => {
                let want_write = f.has_pending_write() || f.inner().conn.wants_write();
                self.event_fd.arm(
                    f.inner().tcp.as_fd(),
                    f.inner().tcp.as_fd().as_raw_fd(),
                    if want_write { Interest::BOTH } else { Interest::READ },
                )
            }
            None => Ok(()),
        }
    }
}

impl TransportOps for TlsTransport {
    fn transport_name(&self) -> &'static str {
        "tls"
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    fn event_fd(&self) -> &EventFd {
        &self.event_fd
    }

    fn connect(&mut self, addr: &str) -> Result<(), XcmError> {
        let (_proto, hp) = parse_host_port_addr(addr)?;
        let tcp = TcpStream::connect((hp.host.trim_start_matches('[').trim_end_matches(']'), hp.port))
            .map_err(XcmError::from)?;
        tcp.set_nonblocking(true)?;
        tcp.set_nodelay(true)?;
        let config = build_client_config(self.cacert_path.as_deref())?;
        let server_name = ServerName::try_from(hp.host.clone()).map_err(|_| XcmError::AddrParse(hp.host.clone()))?;
        let conn = ClientConnection::new(config, server_name)?;
        let stream = TlsStream { tcp, conn: TlsConn::Client(conn) };
        self.role = Some(Role::Connection(Framed::new(stream, MAX_MSG_SIZE)));
        self.arm_current()
    }

    fn bind(&mut self, addr: &str) -> Result<(), XcmError> {
        let cert = self.cert_path.clone().ok_or_else(|| {
            XcmError::Permission("tls server socket requires xcm.tls.cert before bind".into())
        })?;
        let key = self.key_path.clone().ok_or_else(|| {
            XcmError::Permission("tls server socket requires xcm.tls.key before bind".into())
        })?;
        let config = build_server_config(&cert, &key)?;
        let (_proto, hp) = parse_host_port_addr(addr)?;
        let tcp = std::net::TcpListener::bind((hp.host.trim_start_matches('[').trim_end_matches(']'), hp.port))
            .map_err(XcmError::from)?;
        tcp.set_nonblocking(true)?;
        let _ = LISTEN_BACKLOG; // std's TcpListener::bind already applies a kernel backlog
        self.role = Some(Role::Listener { tcp, config });
        self.arm_current()
    }

    fn accept(&mut self) -> Result<Box<dyn TransportOps>, XcmError> {
        let Some(Role::Listener { tcp, config }) = &self.role else {
            return Err(XcmError::Protocol("accept called on a non-listening tls socket".into()));
        };
        match tcp.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                let conn = ServerConnection::new(Arc::clone(config))?;
                let tls_stream = TlsStream { tcp: stream, conn: TlsConn::Server(conn) };
                let mut accepted = Self {
                    role: Some(Role::Connection(Framed::new(tls_stream, MAX_MSG_SIZE))),
                    socket_type: SocketType::Connection,
                    event_fd: EventFd::new()?,
                    counters: Counters::default(),
                    cert_path: None,
                    key_path: None,
                    cacert_path: None,
                };
                accepted.arm_current()?;
                Ok(Box::new(accepted))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(XcmError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, msg: &[u8]) -> Result<(), XcmError> {
        let Some(Role::Connection(framed)) = &mut self.role else {
            return Err(XcmError::Protocol("send called on a non-connection tls socket".into()));
        };
        framed.send(msg)?;
        self.counters.record_send(msg.len());
        self.arm_current()
    }

    fn receive(&mut self) -> Result<Vec<u8>, XcmError> {
        let Some(Role::Connection(framed)) = &mut self.role else {
            return Err(XcmError::Protocol("receive called on a non-connection tls socket".into()));
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
        Ok(match &self.role {
            Some(Role::Listener { tcp, .. }) => {
                local_port(tcp).ok().map(|p| format!("tls:0.0.0.0:{p}"))
            }
            Some(Role::Connection(f)) => f.inner().tcp.local_addr().ok().map(|a| format!("tls:{}:{}", a.ip(), a.port())),
            None => None,
        })
    }

    fn get_remote_addr(&self) -> Result<Option<String>, XcmError> {
        Ok(match &self.role {
            Some(Role::Connection(f)) => {
                f.inner().tcp.peer_addr().ok().map(|a| format!("tls:{}:{}", a.ip(), a.port()))
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

impl AttrSource for TlsTransport {
    fn attr_names(&self) -> Vec<String> {
        vec!["xcm.tls.cert".to_string(), "xcm.tls.key".to_string(), "xcm.tls.cacert".to_string()]
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError> {
        match name {
            "xcm.tls.cert" => self.cert_path.clone().map(AttrValue::Str).ok_or_else(|| XcmError::Protocol(name.to_string())),
            "xcm.tls.key" => self.key_path.clone().map(AttrValue::Str).ok_or_else(|| XcmError::Protocol(name.to_string())),
            "xcm.tls.cacert" => self.cacert_path.clone().map(AttrValue::Str).ok_or_else(|| XcmError::Protocol(name.to_string())),
            _ => Err(XcmError::Protocol(format!("tls has no attribute {name}"))),
        }
    }

    fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<(), XcmError> {
        match name {
            "xcm.tls.cert" => {
                self.cert_path = Some(value.as_str()?.to_string());
                Ok(())
            }
            "xcm.tls.key" => {
                self.key_path = Some(value.as_str()?.to_string());
                Ok(())
            }
            "xcm.tls.cacert" => {
                self.cacert_path = Some(value.as_str()?.to_string());
                Ok(())
            }
            _ => Err(XcmError::Permission(format!("tls has no attribute {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_self_signed_cert(dir: &std::path::Path) -> (String, String) {
        // Minimal deterministic self-signed cert/key pair for the handshake
        // tests is out of scope to generate at test time without extra crates;
        // these tests instead exercise the parts that do not require a live
        // handshake (attribute plumbing, config loading failure modes).
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::File::create(&cert_path).unwrap();
        std::fs::File::create(&key_path).unwrap();
        (cert_path.display().to_string(), key_path.display().to_string())
    }

    #[test]
    fn cert_and_key_attrs_round_trip() {
        let mut t = TlsTransport::new(SocketType::Connection).unwrap();
        t.set_attr("xcm.tls.cert", &AttrValue::Str("/tmp/a.pem".into())).unwrap();
        assert_eq!(t.get_attr("xcm.tls.cert").unwrap().as_str().unwrap(), "/tmp/a.pem");
    }

    #[test]
    fn bind_without_cert_attrs_is_permission_denied() {
        let mut t = TlsTransport::new(SocketType::Server).unwrap();
        let err = t.bind("tls:127.0.0.1:0").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Permission);
    }

    #[test]
    fn empty_pem_file_yields_no_certificates_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed_cert(dir.path());
        let mut f = std::fs::OpenOptions::new().write(true).open(&key).unwrap();
        writeln!(f, "not a real key").unwrap();
        assert!(load_certs(&cert).unwrap().is_empty());
    }
}
