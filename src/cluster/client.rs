//! Dialing side of the cluster: an elastic pool of authenticated connections to one server.
//!
//! Connections are lent out round-robin with idle ones preferred, and every loan is paid back
//! through [`MessageClient::free`]. The pool keeps at least `min_connections` entries, grows by
//! one when every entry is on loan, never holds more than `max_connections`, and closes idle
//! extras as soon as they are returned.
use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use thiserror::Error;

use crate::protocol::{
    Callback, ClientTls, Connection, ConnectionError, ConnectionOptions, JoinRequest, Message,
    MessageType, Payload, PayloadError, ProtocolTransport, Stream, TlsError, TransportError,
    connection::{DEFAULT_QUEUE_CAPACITY, DEFAULT_TIMEOUT},
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no available connections")]
    NoAvailableConnections,
    #[error("client is closed")]
    Closed,
    #[error("server rejected the join request")]
    Rejected,
    #[error("expected a welcome for the join request, got {0:?}")]
    UnexpectedReply(MessageType),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Client IO Error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server; every resolved address is tried in turn.
    pub server: String,
    pub secret: Vec<u8>,
    pub node_id: String,
    pub tags: Vec<String>,
    /// Join as a slave instead of a master.
    pub replica: bool,
    pub min_connections: usize,
    pub max_connections: usize,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
    pub tls: Option<ClientTls>,
}

impl ClientConfig {
    pub fn new(
        server: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            secret: secret.into(),
            node_id: node_id.into(),
            tags: Vec::new(),
            replica: false,
            min_connections: 1,
            max_connections: 4,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            request_timeout: DEFAULT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tls: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_replica(mut self, replica: bool) -> Self {
        self.replica = replica;
        self
    }

    pub fn with_connections(mut self, min: usize, max: usize) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self.normalized()
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Clamps both bounds to at least one and `min` down to `max`.
    pub fn normalized(mut self) -> Self {
        self.max_connections = self.max_connections.max(1);
        self.min_connections = self.min_connections.clamp(1, self.max_connections);
        self
    }
}

struct Entry {
    connection: Connection,
    loans: usize,
}

impl Entry {
    fn idle(connection: Connection) -> Self {
        Self {
            connection,
            loans: 0,
        }
    }
}

#[derive(Default)]
struct Pool {
    entries: Vec<Entry>,
    cursor: usize,
    closed: bool,
    /// Dials in flight with the lock released; they count against `max_connections`.
    dialing: usize,
}

impl Pool {
    fn prune(&mut self) {
        self.entries.retain(|entry| {
            if entry.connection.is_closed() {
                debug!("dropping closed connection {}", entry.connection.id());
            }
            !entry.connection.is_closed()
        });
    }

    fn has_idle(&self) -> bool {
        self.entries.iter().any(|entry| entry.loans == 0)
    }

    /// Lends the next connection after the cursor, preferring idle entries.
    fn lend(&mut self) -> Option<Connection> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }

        let start = self.cursor % len;
        let index = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| self.entries[i].loans == 0)
            .unwrap_or(start);

        self.cursor = index + 1;
        let entry = &mut self.entries[index];
        entry.loans += 1;
        Some(entry.connection.clone())
    }

    /// Closes idle entries, newest first, until only `min` remain.
    fn evict(&mut self, min: usize) {
        while self.entries.len() > min {
            let Some(index) = self.entries.iter().rposition(|entry| entry.loans == 0) else {
                break;
            };
            let entry = self.entries.remove(index);
            debug!("evicting idle connection {}", entry.connection.id());
            if let Err(e) = entry.connection.close() {
                debug!("failed to close {}: {e}", entry.connection.id());
            }
        }
    }
}

pub struct MessageClient {
    config: ClientConfig,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
    callback: Option<Callback>,
    pool: Mutex<Pool>,
}

impl MessageClient {
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        Self::build(config, None)
    }

    /// Like [`MessageClient::connect`], handing frames the server pushes unprompted to
    /// `callback`. Pings are always answered by the client itself.
    pub fn connect_with_callback(
        config: ClientConfig,
        callback: Callback,
    ) -> Result<Self, ClientError> {
        Self::build(config, Some(callback))
    }

    fn build(config: ClientConfig, callback: Option<Callback>) -> Result<Self, ClientError> {
        let config = config.normalized();
        let tls = config.tls.as_ref().map(ClientTls::load).transpose()?;
        let client = Self {
            config,
            tls,
            callback,
            pool: Mutex::new(Pool::default()),
        };

        let warm = client.dial_batch(client.config.min_connections);
        let mut pool = client.pool.lock();
        pool.entries.extend(warm.into_iter().map(Entry::idle));
        info!(
            "connected to {} with {}/{} connections",
            client.config.server,
            pool.entries.len(),
            client.config.min_connections
        );
        drop(pool);
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of pooled connections, loaned or not.
    pub fn size(&self) -> usize {
        self.pool.lock().entries.len()
    }

    /// Borrows a connection. Every successful call must be paired with
    /// [`MessageClient::free`].
    pub fn allocate(&self) -> Result<Connection, ClientError> {
        let wanted = {
            let mut pool = self.pool.lock();
            if pool.closed {
                return Err(ClientError::Closed);
            }
            pool.prune();

            let size = pool.entries.len() + pool.dialing;
            let mut wanted = self.config.min_connections.saturating_sub(size);
            if wanted == 0 && !pool.has_idle() && size < self.config.max_connections {
                wanted = 1;
            }
            pool.dialing += wanted;
            wanted
        };

        let fresh = self.dial_batch(wanted);

        let mut pool = self.pool.lock();
        pool.dialing -= wanted;
        if pool.closed {
            for connection in fresh {
                let _ = connection.close();
            }
            return Err(ClientError::Closed);
        }
        pool.entries.extend(fresh.into_iter().map(Entry::idle));
        pool.lend().ok_or(ClientError::NoAvailableConnections)
    }

    /// Returns a loan taken with [`MessageClient::allocate`].
    pub fn free(&self, connection: &Connection) {
        let mut pool = self.pool.lock();
        match pool
            .entries
            .iter_mut()
            .find(|entry| entry.connection.id() == connection.id())
        {
            Some(entry) => entry.loans = entry.loans.saturating_sub(1),
            None => debug!("freed connection {} is not pooled", connection.id()),
        }
        pool.prune();
        pool.evict(self.config.min_connections);
    }

    /// Sends `message` on a pooled connection and waits for its response.
    pub fn send(&self, message: &Message) -> Result<Message, ClientError> {
        let connection = self.allocate()?;
        let response = connection.send(message);
        self.free(&connection);
        Ok(response?)
    }

    /// Round trip time of a ping on a pooled connection.
    pub fn ping(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        let pong = self.send(&Message::new(MessageType::Ping, Vec::new()))?;
        match pong.message_type() {
            MessageType::Pong => Ok(started.elapsed()),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Closes every pooled connection; later allocations fail with [`ClientError::Closed`].
    pub fn close(&self) {
        let mut pool = self.pool.lock();
        if pool.closed {
            return;
        }
        pool.closed = true;
        for entry in pool.entries.drain(..) {
            if let Err(e) = entry.connection.close() {
                debug!("failed to close {}: {e}", entry.connection.id());
            }
        }
        info!("closed client for {}", self.config.server);
    }

    /// Dials up to `count` connections without holding the pool lock, stopping at the first
    /// failure.
    fn dial_batch(&self, count: usize) -> Vec<Connection> {
        let mut dialed = Vec::with_capacity(count);
        for _ in 0..count {
            match self.dial() {
                Ok(connection) => dialed.push(connection),
                Err(e) => {
                    warn!("failed to dial {}: {e}", self.config.server);
                    break;
                }
            }
        }
        dialed
    }

    fn dial(&self) -> Result<Connection, ClientError> {
        let socket = self.open_socket()?;
        socket.set_nodelay(true)?;
        let deadline = Instant::now() + self.config.dial_timeout;

        let stream = match &self.tls {
            Some((config, name)) => {
                Stream::connect_tls(socket, Arc::clone(config), name.clone(), Some(deadline))?
            }
            None => Stream::plain(socket),
        };
        let (mut reader, mut writer, handle) = stream.split()?;
        reader.set_deadline(Some(deadline))?;

        let join = JoinRequest::signed(
            &self.config.secret,
            &self.config.node_id,
            &self.config.tags,
            self.config.replica,
        );
        let greeting = Message::from_payload(&Payload::Greeting(join))?;
        ProtocolTransport::new(&mut writer).write_message(&greeting)?;

        let welcome = match ProtocolTransport::new(&mut reader).read_message() {
            Ok(welcome) => welcome,
            Err(e) if e.is_disconnect() => {
                let _ = handle.shutdown();
                return Err(ClientError::Rejected);
            }
            Err(e) => {
                let _ = handle.shutdown();
                return Err(e.into());
            }
        };
        if welcome.message_type() != MessageType::Welcome || welcome.id() != greeting.id() {
            let _ = handle.shutdown();
            return Err(ClientError::UnexpectedReply(welcome.message_type()));
        }
        reader.set_deadline(None)?;

        let options = ConnectionOptions::default()
            .with_timeout(self.config.request_timeout)
            .with_queue_capacity(self.config.queue_capacity);
        let connection = Connection::from_parts(reader, writer, handle, options)?;
        connection.listen_with_callback(self.inbound())?;
        debug!("dialed {} as {}", self.config.server, connection.id());
        Ok(connection)
    }

    fn open_socket(&self) -> Result<TcpStream, ClientError> {
        let mut last_error = None;
        for addr in self.config.server.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.config.dial_timeout) {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    debug!("failed to dial {addr}: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} resolved to no addresses", self.config.server),
                )
            })
            .into())
    }

    fn inbound(&self) -> Callback {
        let callback = self.callback.clone();
        Arc::new(move |connection: &Connection, message: Message| {
            if message.message_type() == MessageType::Ping {
                if let Err(e) = connection.answer_ping(&message) {
                    debug!("failed to answer ping on {}: {e}", connection.id());
                }
                return;
            }
            match &callback {
                Some(callback) => callback(connection, message),
                None => debug!(
                    "dropping unsolicited {:?} frame {} on {}",
                    message.message_type(),
                    message.id(),
                    connection.id()
                ),
            }
        })
    }
}

impl Drop for MessageClient {
    fn drop(&mut self) {
        self.close();
    }
}
