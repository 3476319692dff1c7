//! Socket halves for plain TCP and TLS.
//!
//! A [`Stream`] is split once into a [`StreamReader`], a [`StreamWriter`] and a
//! [`StreamHandle`] so a connection can read and write from different threads. Plain
//! sockets are split with [`TcpStream::try_clone`]. TLS sessions share one
//! [`rustls::Connection`] behind a mutex: the reader only takes the lock to feed ciphertext
//! it already pulled off the socket, so a blocked read never stalls the writer.
use std::{
    fs,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, trace};
use parking_lot::Mutex;
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject},
};
use thiserror::Error;

const TLS_READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid PEM in '{path}': {cause:?}")]
    Pem {
        path: PathBuf,
        cause: rustls::pki_types::pem::Error,
    },
    #[error("no certificates found in '{0}'")]
    NoCertificates(PathBuf),
    #[error("invalid server name '{0}'")]
    ServerName(String),
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Certificate chain and private key used by a listening server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl TlsFiles {
    pub fn new(certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            certificate: certificate.into(),
            private_key: private_key.into(),
        }
    }

    pub fn load(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let certs = load_certificates(&self.certificate)?;
        let key = PrivateKeyDer::from_pem_slice(&read_file(&self.private_key)?).map_err(
            |cause| TlsError::Pem {
                path: self.private_key.clone(),
                cause,
            },
        )?;

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
        Ok(Arc::new(config))
    }
}

/// Trust anchors and expected name used by a dialing client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTls {
    pub ca_certificate: PathBuf,
    pub server_name: String,
}

impl ClientTls {
    pub fn new(ca_certificate: impl Into<PathBuf>, server_name: impl Into<String>) -> Self {
        Self {
            ca_certificate: ca_certificate.into(),
            server_name: server_name.into(),
        }
    }

    pub fn load(&self) -> Result<(Arc<ClientConfig>, ServerName<'static>), TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certificates(&self.ca_certificate)? {
            roots.add(cert)?;
        }
        let name = ServerName::try_from(self.server_name.clone())
            .map_err(|_| TlsError::ServerName(self.server_name.clone()))?;

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Ok((Arc::new(config), name))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let bytes = read_file(path)?;
    let certs = CertificateDer::pem_slice_iter(&bytes)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|cause| TlsError::Pem {
            path: path.to_path_buf(),
            cause,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Time left until `deadline`, or a `TimedOut` error once it has passed.
pub fn time_left(deadline: Instant) -> io::Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline passed"));
    }
    Ok(left)
}

/// A connected socket, optionally wrapped in an established TLS session.
pub enum Stream {
    Plain(TcpStream),
    Tls {
        socket: TcpStream,
        session: rustls::Connection,
    },
}

impl Stream {
    pub fn plain(socket: TcpStream) -> Self {
        Stream::Plain(socket)
    }

    /// Runs the server side of a TLS handshake on a freshly accepted socket. With a
    /// deadline the whole handshake has to finish before it.
    pub fn accept_tls(
        mut socket: TcpStream,
        config: Arc<ServerConfig>,
        deadline: Option<Instant>,
    ) -> io::Result<Self> {
        let session = rustls::ServerConnection::new(config).map_err(io::Error::other)?;
        let mut session = rustls::Connection::from(session);
        handshake(&mut session, &mut socket, deadline)?;
        Ok(Stream::Tls { socket, session })
    }

    /// Runs the client side of a TLS handshake on a freshly dialed socket.
    pub fn connect_tls(
        mut socket: TcpStream,
        config: Arc<ClientConfig>,
        name: ServerName<'static>,
        deadline: Option<Instant>,
    ) -> io::Result<Self> {
        let session = rustls::ClientConnection::new(config, name).map_err(io::Error::other)?;
        let mut session = rustls::Connection::from(session);
        handshake(&mut session, &mut socket, deadline)?;
        Ok(Stream::Tls { socket, session })
    }

    pub fn socket(&self) -> &TcpStream {
        match self {
            Stream::Plain(socket) => socket,
            Stream::Tls { socket, .. } => socket,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls { .. })
    }

    pub fn split(self) -> io::Result<(StreamReader, StreamWriter, StreamHandle)> {
        match self {
            Stream::Plain(socket) => {
                let handle = StreamHandle::new(socket.try_clone()?);
                let writer = StreamWriter {
                    socket: socket.try_clone()?,
                    tls: None,
                };
                let reader = StreamReader {
                    socket,
                    tls: None,
                    deadline: None,
                };
                Ok((reader, writer, handle))
            }
            Stream::Tls { socket, session } => {
                let handle = StreamHandle::new(socket.try_clone()?);
                let writer_socket = socket.try_clone()?;
                let tls = Arc::new(TlsShared {
                    session: Mutex::new(session),
                    outgoing: Mutex::new(socket.try_clone()?),
                });
                let reader = StreamReader {
                    socket,
                    tls: Some(TlsReader {
                        shared: Arc::clone(&tls),
                        ciphertext: Vec::new(),
                        scratch: vec![0; TLS_READ_CHUNK],
                    }),
                    deadline: None,
                };
                let writer = StreamWriter {
                    socket: writer_socket,
                    tls: Some(tls),
                };
                Ok((reader, writer, handle))
            }
        }
    }
}

fn handshake(
    session: &mut rustls::Connection,
    socket: &mut TcpStream,
    deadline: Option<Instant>,
) -> io::Result<()> {
    while session.is_handshaking() {
        if session.wants_write() {
            if let Some(deadline) = deadline {
                socket.set_write_timeout(Some(time_left(deadline)?))?;
            }
            session.write_tls(socket)?;
            continue;
        }
        if let Some(deadline) = deadline {
            socket.set_read_timeout(Some(time_left(deadline)?))?;
        }
        if session.read_tls(socket)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed during TLS handshake",
            ));
        }
        session
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
    while session.wants_write() {
        if let Some(deadline) = deadline {
            socket.set_write_timeout(Some(time_left(deadline)?))?;
        }
        session.write_tls(socket)?;
    }
    if deadline.is_some() {
        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)?;
    }
    debug!("TLS handshake completed");
    Ok(())
}

/// Session state shared by both halves of a split TLS stream.
///
/// `session` is only ever held to move bytes between rustls and memory. `outgoing` owns the
/// write side of the socket and is held across socket writes, which keeps records in order
/// without ever blocking the reader on a full send buffer.
struct TlsShared {
    session: Mutex<rustls::Connection>,
    outgoing: Mutex<TcpStream>,
}

impl TlsShared {
    /// Encrypts whatever the session has queued and writes it out. The caller holds
    /// `outgoing`.
    fn send_records(&self, socket: &mut TcpStream) -> io::Result<()> {
        loop {
            let mut records = Vec::new();
            {
                let mut session = self.session.lock();
                while session.wants_write() {
                    session.write_tls(&mut records)?;
                }
            }
            if records.is_empty() {
                return Ok(());
            }
            socket.write_all(&records)?;
        }
    }
}

struct TlsReader {
    shared: Arc<TlsShared>,
    /// Ciphertext pulled off the socket but not yet handed to the session.
    ciphertext: Vec<u8>,
    scratch: Vec<u8>,
}

pub struct StreamReader {
    socket: TcpStream,
    tls: Option<TlsReader>,
    deadline: Option<Instant>,
}

impl StreamReader {
    /// Bounds every following socket read by `deadline`. `None` goes back to blocking reads.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.deadline = deadline;
        if deadline.is_none() {
            self.socket.set_read_timeout(None)?;
        }
        Ok(())
    }
}

fn read_socket(
    socket: &mut TcpStream,
    deadline: Option<Instant>,
    buf: &mut [u8],
) -> io::Result<usize> {
    if let Some(deadline) = deadline {
        socket.set_read_timeout(Some(time_left(deadline)?))?;
    }
    socket.read(buf)
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(tls) = &mut self.tls else {
            return read_socket(&mut self.socket, self.deadline, buf);
        };

        loop {
            let fed = {
                let mut session = tls.shared.session.lock();
                match session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }

                if tls.ciphertext.is_empty() {
                    false
                } else {
                    let mut incoming = &tls.ciphertext[..];
                    let consumed = session.read_tls(&mut incoming)?;
                    tls.ciphertext.drain(..consumed);
                    session
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    true
                }
            };

            // Replies the session queued (key updates, alerts) go out now unless the writer
            // is busy, in which case its next write carries them.
            if let Some(mut outgoing) = tls.shared.outgoing.try_lock() {
                tls.shared.send_records(&mut outgoing)?;
            }

            if fed {
                continue;
            }
            let n = read_socket(&mut self.socket, self.deadline, &mut tls.scratch)?;
            if n == 0 {
                return Ok(0);
            }
            trace!("read {n} TLS bytes");
            tls.ciphertext.extend_from_slice(&tls.scratch[..n]);
        }
    }
}

pub struct StreamWriter {
    socket: TcpStream,
    tls: Option<Arc<TlsShared>>,
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(tls) = &self.tls else {
            return self.socket.write(buf);
        };
        let mut socket = tls.outgoing.lock();
        let n = tls.session.lock().writer().write(buf)?;
        tls.send_records(&mut socket)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(tls) = &self.tls else {
            return self.socket.flush();
        };
        let mut socket = tls.outgoing.lock();
        tls.session.lock().writer().flush()?;
        tls.send_records(&mut socket)?;
        socket.flush()
    }
}

/// Out-of-band control over a split socket: timeouts, addresses and shutdown.
#[derive(Debug)]
pub struct StreamHandle {
    socket: TcpStream,
}

impl StreamHandle {
    fn new(socket: TcpStream) -> Self {
        Self { socket }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_write_timeout(timeout)
    }

    /// Shuts both directions down, waking any thread blocked on the socket.
    pub fn shutdown(&self) -> io::Result<()> {
        match self.socket.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{io::Write as _, net::TcpListener, sync::mpsc, thread};

    use tempdir::TempDir;

    use super::*;

    /// Self-signed `localhost` certificate written into `dir`, with the server files and the
    /// client trust settings that go with it.
    pub(crate) fn self_signed(dir: &TempDir) -> (TlsFiles, ClientTls) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        fs::write(&cert_path, cert.pem()).unwrap();
        fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        (
            TlsFiles::new(&cert_path, &key_path),
            ClientTls::new(&cert_path, "localhost"),
        )
    }

    fn tls_pair() -> (Stream, Stream) {
        let dir = TempDir::new("tls-pair").unwrap();
        let (server, client) = self_signed(&dir);
        let server = server.load().unwrap();
        let (client, name) = client.load().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            Stream::accept_tls(socket, server, None).unwrap()
        });
        let socket = TcpStream::connect(addr).unwrap();
        let dialed = Stream::connect_tls(socket, client, name, None).unwrap();
        (accepted.join().unwrap(), dialed)
    }

    #[test]
    fn plain_split_reads_and_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0; 5];
            socket.read_exact(&mut buf).unwrap();
            socket.write_all(&buf).unwrap();
        });

        let stream = Stream::plain(TcpStream::connect(addr).unwrap());
        assert!(!stream.is_tls());
        let (mut reader, mut writer, handle) = stream.split().unwrap();

        writer.write_all(b"hello").unwrap();
        let mut buf = [0; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(handle.peer_addr(), Some(addr));

        echo.join().unwrap();
    }

    #[test]
    fn shutdown_wakes_blocked_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _peer = thread::spawn(move || listener.accept().unwrap());

        let (mut reader, _writer, handle) =
            Stream::plain(TcpStream::connect(addr).unwrap()).split().unwrap();
        let blocked = thread::spawn(move || {
            let mut buf = [0; 1];
            reader.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(50));
        handle.shutdown().unwrap();
        handle.shutdown().unwrap();

        let result = blocked.join().unwrap();
        assert!(matches!(result, Ok(0) | Err(_)));
    }

    #[test]
    fn missing_certificate_file() {
        let dir = TempDir::new("tls-missing").unwrap();
        let files = TlsFiles::new(dir.path().join("cert.pem"), dir.path().join("key.pem"));

        assert!(matches!(files.load(), Err(TlsError::Read { .. })));
    }

    #[test]
    fn certificate_file_without_certificates() {
        let dir = TempDir::new("tls-empty").unwrap();
        let cert = dir.path().join("cert.pem");
        let mut file = fs::File::create(&cert).unwrap();
        writeln!(file, "not a pem file").unwrap();

        let files = TlsFiles::new(&cert, dir.path().join("key.pem"));
        assert!(matches!(files.load(), Err(TlsError::NoCertificates(_))));

        let client = ClientTls::new(&cert, "localhost");
        assert!(matches!(client.load(), Err(TlsError::NoCertificates(_))));
    }

    #[test]
    fn tls_split_reads_and_writes() {
        let (server, client) = tls_pair();
        assert!(server.is_tls() && client.is_tls());
        let (mut server_reader, mut server_writer, _server) = server.split().unwrap();
        let (mut client_reader, mut client_writer, _client) = client.split().unwrap();

        client_writer.write_all(b"hello").unwrap();
        client_writer.flush().unwrap();
        let mut buf = [0; 5];
        server_reader.read_exact(&mut buf).unwrap();
        server_writer.write_all(&buf).unwrap();
        server_writer.flush().unwrap();

        let mut echoed = [0; 5];
        client_reader.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[test]
    fn tls_halves_stream_both_ways_at_once() {
        const TOTAL: usize = 8 * 1024 * 1024;

        let (server, client) = tls_pair();
        let pump = |stream: Stream, seed: u8| {
            let (mut reader, mut writer, handle) = stream.split().unwrap();
            handle.set_read_timeout(Some(Duration::from_secs(20))).unwrap();
            let sender = thread::spawn(move || {
                let chunk = vec![seed; 64 * 1024];
                for _ in 0..TOTAL / chunk.len() {
                    writer.write_all(&chunk).unwrap();
                }
                writer.flush().unwrap();
                writer
            });
            let receiver = thread::spawn(move || {
                let mut received = vec![0; TOTAL];
                reader.read_exact(&mut received).map(|_| received)
            });
            (sender, receiver, handle)
        };

        let (server_sender, server_receiver, _server) = pump(server, 1);
        let (client_sender, client_receiver, _client) = pump(client, 2);

        let at_client = client_receiver.join().unwrap().unwrap();
        let at_server = server_receiver.join().unwrap().unwrap();
        assert!(at_client.iter().all(|&b| b == 1));
        assert!(at_server.iter().all(|&b| b == 2));
        server_sender.join().unwrap();
        client_sender.join().unwrap();
    }

    #[test]
    fn tls_handshake_gives_up_at_deadline() {
        let dir = TempDir::new("tls-silent").unwrap();
        let (server, _) = self_signed(&dir);
        let server = server.load().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = TcpStream::connect(addr).unwrap();
        let (socket, _) = listener.accept().unwrap();

        let started = Instant::now();
        let deadline = started + Duration::from_millis(200);
        assert!(Stream::accept_tls(socket, server, Some(deadline)).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn deadline_bounds_a_trickling_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = mpsc::channel::<()>();
        let trickle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            while stopped.recv_timeout(Duration::from_millis(50)).is_err() {
                if socket.write_all(&[0]).is_err() {
                    break;
                }
            }
        });

        let (mut reader, _writer, _handle) =
            Stream::plain(TcpStream::connect(addr).unwrap()).split().unwrap();
        let started = Instant::now();
        reader.set_deadline(Some(started + Duration::from_millis(300))).unwrap();

        let mut buf = [0; 64];
        assert!(reader.read_exact(&mut buf).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));

        stop.send(()).unwrap();
        trickle.join().unwrap();
    }

    #[test]
    fn time_left_fails_once_passed() {
        let passed = Instant::now() - Duration::from_millis(1);
        let err = time_left(passed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let later = Instant::now() + Duration::from_secs(60);
        assert!(time_left(later).unwrap() > Duration::from_secs(59));
    }
}
