//! Accepting side of the cluster.
//!
//! Every accepted socket walks `Accepted -> Authenticating -> Registered -> Serving ->
//! Closed` on its own thread. Authentication reads exactly one frame within the handshake
//! timeout; anything other than a valid, signed join request closes the socket without a
//! reply. Once registered, each frame is handed to the message handler on the worker pool,
//! except pings which are answered on the read loop itself.
use std::{
    error::Error,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::protocol::{
    Connection, ConnectionError, ConnectionId, ConnectionOptions, ErrorCode, ErrorReply,
    JoinRequest, Message, MessageType, Payload, PayloadError, ProtocolTransport, Stream,
    ThreadPool, TlsError, TlsFiles, TransportError,
    connection::{DEFAULT_QUEUE_CAPACITY, DEFAULT_TIMEOUT},
    stream::time_left,
    thread::spawn_supervised,
};

use super::{
    auth::{AuthError, JoinValidator},
    node::{NodeRegistry, Role},
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WORKERS: usize = 15;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("undecodable join request: {0}")]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Server IO Error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub secret: Vec<u8>,
    /// Total time allowed for the TLS handshake, the join frame and the welcome reply.
    pub handshake_timeout: Duration,
    /// How long server initiated requests wait for a response.
    pub response_timeout: Duration,
    /// Certificate and key; `None` serves plain TCP.
    pub tls: Option<TlsFiles>,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Largest accepted distance between a join timestamp and local time.
    pub max_clock_skew: Option<Duration>,
}

impl ServerConfig {
    pub fn new(address: SocketAddr, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            secret: secret.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            response_timeout: DEFAULT_TIMEOUT,
            tls: None,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_clock_skew: None,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsFiles) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = Some(skew);
        self
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::default()
            .with_timeout(self.response_timeout)
            .with_queue_capacity(self.queue_capacity)
    }
}

pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Application handler for frames that are neither pings nor responses. A returned message
/// is written back on the same connection; build it with [`Message::reply`] so the peer can
/// correlate it.
pub type MessageHandler =
    Arc<dyn Fn(&Connection, &Message) -> Result<Option<Message>, HandlerError> + Send + Sync>;

type ConnectionObserver = Arc<dyn Fn(&Connection, &JoinRequest) + Send + Sync>;
type DisconnectObserver = Arc<dyn Fn(&str, &Connection) + Send + Sync>;
type ListeningObserver = Arc<dyn Fn(SocketAddr) + Send + Sync>;
type ShutdownObserver = Arc<dyn Fn() + Send + Sync>;

/// Hooks into the server lifecycle. Every hook is optional.
#[derive(Clone, Default)]
pub struct ServerCallbacks {
    on_connection: Option<ConnectionObserver>,
    on_message: Option<MessageHandler>,
    on_listening: Option<ListeningObserver>,
    on_shutdown: Option<ShutdownObserver>,
    on_disconnect: Option<DisconnectObserver>,
    join_validator: Option<JoinValidator>,
}

impl ServerCallbacks {
    pub fn on_connection<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection, &JoinRequest) + Send + Sync + 'static,
    {
        self.on_connection = Some(Arc::new(f));
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection, &Message) -> Result<Option<Message>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_listening<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.on_listening = Some(Arc::new(f));
        self
    }

    pub fn on_shutdown<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_shutdown = Some(Arc::new(f));
        self
    }

    /// Called with the node id once a registered connection has been closed.
    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Connection) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Extra acceptance policy, run after the digest has been verified.
    pub fn join_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&JoinRequest, Option<SocketAddr>) -> bool + Send + Sync + 'static,
    {
        self.join_validator = Some(Arc::new(f));
        self
    }
}

/// One slave connection addressed by a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub node_id: String,
    pub connection: ConnectionId,
}

/// Outcome of [`MessageServer::send_to_slaves`]. A broadcast never stops at the first
/// failure; every slave connection is attempted.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<Delivery>,
    pub failed: Vec<(Delivery, ConnectionError)>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cheaply cloneable handle to a bound server.
#[derive(Clone)]
pub struct MessageServer {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    callbacks: ServerCallbacks,
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    registry: NodeRegistry,
    pool: ThreadPool,
    shutdown: AtomicBool,
}

impl MessageServer {
    /// Loads TLS material and binds the listening socket. Nothing is accepted until
    /// [`MessageServer::run`] or [`MessageServer::start`].
    pub fn bind(config: ServerConfig, callbacks: ServerCallbacks) -> Result<Self, ServerError> {
        let tls = config.tls.as_ref().map(TlsFiles::load).transpose()?;
        let listener = TcpListener::bind(config.address)?;
        let local_addr = listener.local_addr()?;
        let pool = ThreadPool::new("handler", config.workers)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                callbacks,
                listener,
                local_addr,
                tls,
                registry: NodeRegistry::new(),
                pool,
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Runs the accept loop on the calling thread until [`MessageServer::shutdown`].
    pub fn run(&self) -> Result<(), ServerError> {
        let addr = self.local_addr();
        info!(
            "listening at {addr}{}",
            if self.inner.tls.is_some() { " (tls)" } else { "" }
        );
        if let Some(on_listening) = &self.inner.callbacks.on_listening {
            on_listening(addr);
        }

        for stream in self.inner.listener.incoming() {
            if self.is_shutdown() {
                break;
            }
            match stream {
                Ok(socket) => {
                    let name = match socket.peer_addr() {
                        Ok(peer) => format!("conn-{peer}"),
                        Err(_) => "conn".to_string(),
                    };
                    let server = self.clone();
                    if let Err(e) = spawn_supervised(name, move || server.handle_socket(socket)) {
                        error!("failed to spawn connection thread: {e}");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("stopped accepting at {addr}");
        Ok(())
    }

    /// Runs the accept loop on a background thread.
    pub fn start(&self) -> Result<JoinHandle<()>, ServerError> {
        let server = self.clone();
        let handle = spawn_supervised(format!("accept-{}", self.local_addr()), move || {
            server.run()
        })?;
        Ok(handle)
    }

    /// Stops accepting, closes every registered connection and fires the shutdown hook.
    /// Only the first call does any work.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down server at {}", self.local_addr());

        // Wake the accept loop so it observes the flag.
        let wake = wake_address(self.local_addr());
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            debug!("failed to wake accept loop: {e}");
        }

        for (node_id, connection) in self.inner.registry.connections() {
            if let Err(e) = connection.close() {
                debug!("failed to close connection of {node_id}: {e}");
            }
        }

        if let Some(on_shutdown) = &self.inner.callbacks.on_shutdown {
            on_shutdown();
        }
    }

    /// Writes `message` to every slave connection without waiting for responses.
    pub fn send_to_slaves(&self, message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (delivery, connection) in self.slave_connections() {
            match connection.write_message(message) {
                Ok(_) => report.delivered.push(delivery),
                Err(e) => {
                    warn!(
                        "broadcast to {} on {} failed: {e}",
                        delivery.node_id, delivery.connection
                    );
                    report.failed.push((delivery, e));
                }
            }
        }
        debug!(
            "broadcast {:?} {}: {} delivered, {} failed",
            message.message_type(),
            message.id(),
            report.delivered.len(),
            report.failed.len()
        );
        report
    }

    /// Sends `message` to every slave connection in parallel and waits for each response.
    pub fn request_slaves(
        &self,
        message: &Message,
    ) -> Vec<(Delivery, Result<Message, ConnectionError>)> {
        let targets = self.slave_connections();
        thread::scope(|scope| {
            let requests = targets
                .into_iter()
                .map(|(delivery, connection)| {
                    scope.spawn(move || {
                        let result = connection.send(message);
                        (delivery, result)
                    })
                })
                .collect::<Vec<_>>();

            requests
                .into_iter()
                .filter_map(|request| match request.join() {
                    Ok(outcome) => Some(outcome),
                    Err(_) => {
                        error!("slave request thread panicked");
                        None
                    }
                })
                .collect()
        })
    }

    fn slave_connections(&self) -> Vec<(Delivery, Connection)> {
        self.inner
            .registry
            .slaves()
            .into_iter()
            .flat_map(|node| {
                node.connections.into_iter().map(move |connection| {
                    let delivery = Delivery {
                        node_id: node.id.clone(),
                        connection: connection.id(),
                    };
                    (delivery, connection)
                })
            })
            .collect()
    }

    fn handle_socket(&self, socket: TcpStream) -> Result<(), ServerError> {
        let peer = socket.peer_addr().ok();
        if self.is_shutdown() {
            return Ok(());
        }
        debug!("accepted {peer:?}");

        let deadline = Instant::now() + self.inner.config.handshake_timeout;
        let stream = match &self.inner.tls {
            Some(tls) => Stream::accept_tls(socket, Arc::clone(tls), Some(deadline))?,
            None => Stream::plain(socket),
        };
        let (mut reader, mut writer, handle) = stream.split()?;

        reader.set_deadline(Some(deadline))?;
        let (greeting, join) = match self.authenticate(&mut reader, peer) {
            Ok(joined) => joined,
            Err(e) => {
                let _ = handle.shutdown();
                return Err(e);
            }
        };
        reader.set_deadline(None)?;

        let welcome = Message::reply(&greeting, MessageType::Welcome, Vec::new());
        handle.set_write_timeout(Some(time_left(deadline)?))?;
        ProtocolTransport::new(&mut writer).write_message(&welcome)?;
        handle.set_write_timeout(None)?;

        let connection = Connection::from_parts(
            reader,
            writer,
            handle,
            self.inner.config.connection_options(),
        )?;
        if let Some(on_connection) = &self.inner.callbacks.on_connection {
            on_connection(&connection, &join);
        }

        let node_id = join.node_id;
        self.inner.registry.register(
            &node_id,
            Role::from_replica_flag(join.is_replica),
            &join.tags,
            connection.clone(),
        );
        info!("{node_id} joined from {peer:?} on {}", connection.id());

        // A shutdown that ran before registration did not see this connection.
        if self.is_shutdown() {
            let _ = connection.close();
        }

        let server = self.clone();
        let result = connection.serve(Some(Arc::new(
            move |connection: &Connection, message: Message| server.dispatch(connection, message),
        )));

        self.inner.registry.remove_connection(&node_id, connection.id());
        info!("{node_id} disconnected from {}", connection.id());
        if let Some(on_disconnect) = &self.inner.callbacks.on_disconnect {
            on_disconnect(&node_id, &connection);
        }

        result.map_err(Into::into)
    }

    fn authenticate(
        &self,
        reader: &mut impl io::Read,
        peer: Option<SocketAddr>,
    ) -> Result<(Message, JoinRequest), ServerError> {
        let greeting = ProtocolTransport::new(reader).read_message()?;
        let join = match greeting.payload()? {
            Payload::Greeting(join) => join,
            _ => {
                return Err(AuthError::UnexpectedMessage(format!(
                    "{:?}",
                    greeting.message_type()
                ))
                .into());
            }
        };

        join.validate()?;
        join.verify(&self.inner.config.secret)?;
        if let Some(skew) = self.inner.config.max_clock_skew {
            join.check_freshness(skew)?;
        }
        if let Some(validator) = &self.inner.callbacks.join_validator {
            if !validator(&join, peer) {
                return Err(AuthError::Rejected.into());
            }
        }
        Ok((greeting, join))
    }

    fn dispatch(&self, connection: &Connection, message: Message) {
        if message.message_type() == MessageType::Ping {
            if let Err(e) = connection.answer_ping(&message) {
                debug!("failed to answer ping on {}: {e}", connection.id());
            }
            return;
        }

        let Some(handler) = self.inner.callbacks.on_message.clone() else {
            debug!(
                "no handler for {:?} frame {}",
                message.message_type(),
                message.id()
            );
            return;
        };

        let connection = connection.clone();
        if let Err(e) = self
            .inner
            .pool
            .execute(move || handle_message(&handler, &connection, message))
        {
            warn!("dropping frame: {e}");
        }
    }
}

fn handle_message(handler: &MessageHandler, connection: &Connection, message: Message) {
    let reply = match handler(connection, &message) {
        Ok(Some(reply)) => reply,
        Ok(None) => return,
        Err(e) => {
            warn!(
                "handler failed for {:?} frame {}: {e}",
                message.message_type(),
                message.id()
            );
            let error = Payload::Error(ErrorReply {
                code: ErrorCode::Handler,
                description: e.to_string(),
            });
            match Message::reply_with(&message, &error) {
                Ok(reply) => reply,
                Err(e) => {
                    error!("failed to encode error reply: {e}");
                    return;
                }
            }
        }
    };

    if let Err(e) = connection.write_message(&reply) {
        debug!("failed to reply to {} on {}: {e}", message.id(), connection.id());
    }
}

fn wake_address(local: SocketAddr) -> SocketAddr {
    let mut addr = local;
    if addr.ip().is_unspecified() {
        match addr {
            SocketAddr::V4(_) => addr.set_ip(Ipv4Addr::LOCALHOST.into()),
            SocketAddr::V6(_) => addr.set_ip(Ipv6Addr::LOCALHOST.into()),
        }
    }
    addr
}
