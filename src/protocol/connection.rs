//! Duplex connection.
//!
//! A [`Connection`] owns one socket and lets any number of threads talk over it at once:
//!
//! - Outbound bytes go through a bounded queue drained by a single writer thread, so frames
//!   from different callers never interleave on the socket. A full queue blocks producers.
//! - [`Connection::send`] registers a single-slot response channel under the request's
//!   [`MessageId`] and blocks until the read loop delivers the frame carrying the same id or
//!   the timeout elapses.
//! - The read loop ([`Connection::serve`], [`Connection::listen`]) decodes frames one at a
//!   time, hands correlated responses to their waiter and everything else to a callback.
//!   A response that arrives after its [`Connection::send`] timed out is logged and dropped.
//!
//! Closing is idempotent and happens exactly once, whichever side notices first. Sends that
//! are in flight when the socket dies are not woken early; each one ends through its own
//! timeout.
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, SyncSender, TrySendError},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use uuid::Uuid;

use super::{
    Message, MessageId, MessageType,
    stream::{Stream, StreamHandle, StreamReader, StreamWriter},
    thread::spawn_supervised,
    transport::{ProtocolTransport, TransportError},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
/// Ids of timed out requests remembered so their late responses can be discarded.
const EXPIRED_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("no response to {id} within {timeout:?}")]
    Timeout { id: MessageId, timeout: Duration },
    #[error("request {0} is already in flight on this connection")]
    DuplicateId(MessageId),
    #[error("read loop already started")]
    AlreadyListening,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Connection IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-connection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// How long [`Connection::send`] waits for a correlated response.
    pub timeout: Duration,
    /// Frames that may wait for the writer before producers block.
    pub queue_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ConnectionOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Stable identity of a connection, independent of its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives frames that no pending [`Connection::send`] is waiting for.
pub type Callback = Arc<dyn Fn(&Connection, Message) + Send + Sync>;

/// Cheaply cloneable handle to one duplex socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

struct Shared {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    timeout: Duration,
    pending: Mutex<HashMap<MessageId, SyncSender<Message>>>,
    expired: Mutex<VecDeque<MessageId>>,
    queue: Mutex<Option<SyncSender<Vec<u8>>>>,
    reader: Mutex<Option<StreamReader>>,
    socket: StreamHandle,
    closed: AtomicBool,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl Connection {
    /// Wraps a connected stream and starts its writer thread. The read loop is started
    /// separately with [`Connection::serve`] or one of the `listen` variants.
    pub fn new(stream: Stream, options: ConnectionOptions) -> Result<Self, ConnectionError> {
        let (reader, writer, socket) = stream.split()?;
        Self::from_parts(reader, writer, socket, options)
    }

    pub(crate) fn from_parts(
        reader: StreamReader,
        writer: StreamWriter,
        socket: StreamHandle,
        options: ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        let (queue, outbound) = mpsc::sync_channel(options.queue_capacity.max(1));
        let connection = Self {
            inner: Arc::new(Shared {
                id: ConnectionId(Uuid::new_v4()),
                peer: socket.peer_addr(),
                timeout: options.timeout,
                pending: Mutex::new(HashMap::new()),
                expired: Mutex::new(VecDeque::new()),
                queue: Mutex::new(Some(queue)),
                reader: Mutex::new(Some(reader)),
                socket,
                closed: AtomicBool::new(false),
                done: Mutex::new(false),
                done_signal: Condvar::new(),
            }),
        };

        // The writer only holds a weak reference so dropping every handle ends it.
        let shared = Arc::downgrade(&connection.inner);
        spawn_supervised(format!("writer-{}", connection.id()), move || {
            let result = write_loop(writer, outbound, &shared);
            if let Some(inner) = shared.upgrade() {
                let _ = Connection { inner }.close();
            }
            result
        })?;

        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of [`Connection::send`] calls currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Sends `message` and waits for the frame that echoes its id.
    pub fn send(&self, message: &Message) -> Result<Message, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let id = message.id();
        let (slot, response) = mpsc::sync_channel(1);
        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&id) {
                return Err(ConnectionError::DuplicateId(id));
            }
            pending.insert(id, slot);
        }

        if let Err(e) = self.write(message.to_bytes()) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match response.recv_timeout(self.inner.timeout) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => {
                let removed = {
                    let mut pending = self.inner.pending.lock();
                    let removed = pending.remove(&id).is_some();
                    // Recorded under the pending lock so the read loop sees either the slot
                    // or the expired id.
                    if removed {
                        self.expire(id);
                    }
                    removed
                };
                // The read loop may have claimed the slot between the timeout and the removal.
                if !removed {
                    if let Ok(message) = response.try_recv() {
                        return Ok(message);
                    }
                }
                debug!("request {id} on {} timed out", self.id());
                Err(ConnectionError::Timeout {
                    id,
                    timeout: self.inner.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ConnectionError::Closed),
        }
    }

    /// Queues raw bytes for the writer thread.
    ///
    /// Blocks while the queue is full and fails as soon as the connection is closed.
    pub fn write(&self, bytes: Vec<u8>) -> Result<usize, ConnectionError> {
        let queue = self
            .inner
            .queue
            .lock()
            .clone()
            .ok_or(ConnectionError::Closed)?;
        let len = bytes.len();
        queue.send(bytes).map_err(|_| ConnectionError::Closed)?;
        Ok(len)
    }

    pub fn write_message(&self, message: &Message) -> Result<usize, ConnectionError> {
        self.write(message.to_bytes())
    }

    /// Runs the read loop on the calling thread until the connection closes.
    ///
    /// A clean disconnect by the peer returns `Ok`; framing and IO failures are returned
    /// after the connection has been closed.
    pub fn serve(&self, callback: Option<Callback>) -> Result<(), ConnectionError> {
        let reader = self
            .inner
            .reader
            .lock()
            .take()
            .ok_or(ConnectionError::AlreadyListening)?;
        let mut transport = ProtocolTransport::new(reader);

        let result = loop {
            match transport.read_message() {
                Ok(message) => self.dispatch(message, callback.as_ref()),
                Err(_) if self.is_closed() => break Ok(()),
                Err(e) if e.is_disconnect() => {
                    debug!("{} disconnected: {e}", self.id());
                    break Ok(());
                }
                Err(e) => break Err(ConnectionError::Transport(e)),
            }
        };

        let _ = self.close();
        result
    }

    /// Starts the read loop on its own thread. Unsolicited frames are logged and dropped.
    pub fn listen(&self) -> Result<JoinHandle<()>, ConnectionError> {
        self.spawn_reader(None)
    }

    /// Starts the read loop on its own thread, handing unsolicited frames to `callback`.
    pub fn listen_with_callback(
        &self,
        callback: Callback,
    ) -> Result<JoinHandle<()>, ConnectionError> {
        self.spawn_reader(Some(callback))
    }

    fn spawn_reader(&self, callback: Option<Callback>) -> Result<JoinHandle<()>, ConnectionError> {
        if self.inner.reader.lock().is_none() {
            return Err(ConnectionError::AlreadyListening);
        }
        let handle = self.clone();
        let thread = spawn_supervised(format!("reader-{}", self.id()), move || {
            handle.serve(callback)
        })?;
        Ok(thread)
    }

    fn expire(&self, id: MessageId) {
        let mut expired = self.inner.expired.lock();
        if expired.len() == EXPIRED_CAPACITY {
            expired.pop_front();
        }
        expired.push_back(id);
    }

    /// Forgets `id` if it belonged to a timed out request. Returns whether it did.
    fn take_expired(&self, id: MessageId) -> bool {
        let mut expired = self.inner.expired.lock();
        match expired.iter().position(|&expired| expired == id) {
            Some(index) => {
                expired.remove(index);
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, message: Message, callback: Option<&Callback>) {
        let slot = self.inner.pending.lock().remove(&message.id());
        match slot {
            Some(slot) => match slot.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message) | TrySendError::Disconnected(message)) => {
                    debug!("waiter for {} already gone", message.id());
                }
            },
            None if self.take_expired(message.id()) => debug!(
                "dropping late response {} on {}",
                message.id(),
                self.id()
            ),
            None => match callback {
                Some(callback) => callback(self, message),
                None => debug!(
                    "dropping unsolicited {:?} frame {} on {}",
                    message.message_type(),
                    message.id(),
                    self.id()
                ),
            },
        }
    }

    /// Closes the connection. Only the first call does any work.
    pub fn close(&self) -> Result<(), ConnectionError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing connection {}", self.id());

        {
            let mut done = self.inner.done.lock();
            *done = true;
            self.inner.done_signal.notify_all();
        }
        self.inner.queue.lock().take();

        if let Err(e) = self.inner.socket.shutdown() {
            warn!("failed to shut down {}: {e}", self.id());
            return Err(e.into());
        }
        Ok(())
    }

    /// Blocks until the connection is closed or `timeout` elapses. Returns whether it closed.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.done.lock();
        while !*done {
            if self.inner.done_signal.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        *done
    }

    /// Replies to a ping without involving any application handler.
    pub(crate) fn answer_ping(&self, ping: &Message) -> Result<(), ConnectionError> {
        self.write_message(&Message::reply(ping, MessageType::Pong, Vec::new()))?;
        Ok(())
    }
}

fn write_loop(
    writer: StreamWriter,
    outbound: mpsc::Receiver<Vec<u8>>,
    shared: &Weak<Shared>,
) -> Result<(), ConnectionError> {
    let closed = || {
        shared
            .upgrade()
            .is_none_or(|inner| inner.closed.load(Ordering::Acquire))
    };

    let mut transport = ProtocolTransport::new(writer);
    for frame in outbound {
        if closed() {
            break;
        }
        if let Err(e) = transport.write_frame(&frame) {
            if closed() {
                break;
            }
            return Err(e.into());
        }
        trace!("wrote {} bytes", frame.len());
    }
    Ok(())
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        sync::mpsc,
        thread,
    };

    use super::*;

    /// Returns a served client-side connection and the raw server-side transport.
    fn pair(timeout: Duration) -> (Connection, ProtocolTransport<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let connection = Connection::new(
            Stream::plain(client),
            ConnectionOptions::default().with_timeout(timeout),
        )
        .unwrap();
        connection.listen().unwrap();
        (connection, ProtocolTransport::new(server))
    }

    #[test]
    fn send_receives_correlated_response() {
        let (connection, mut peer) = pair(Duration::from_secs(5));

        let responder = thread::spawn(move || {
            let request = peer.read_message().unwrap();
            let response = Message::reply(&request, MessageType::Pong, vec![]);
            peer.write_message(&response).unwrap();
            peer
        });

        let request = Message::new(MessageType::Ping, vec![]);
        let response = connection.send(&request).unwrap();
        assert_eq!(response.id(), request.id());
        assert_eq!(response.message_type(), MessageType::Pong);
        assert_eq!(connection.pending_requests(), 0);

        let _peer = responder.join().unwrap();
    }

    #[test]
    fn interleaved_responses_reach_their_callers() {
        let (connection, mut peer) = pair(Duration::from_secs(5));
        let k = 8;

        let responder = thread::spawn(move || {
            let mut requests = (0..k)
                .map(|_| peer.read_message().unwrap())
                .collect::<Vec<_>>();
            requests.reverse();
            requests.swap(0, k / 2);
            for request in requests {
                let body = request.body().to_vec();
                peer.write_message(&Message::reply(&request, MessageType::Select, body))
                    .unwrap();
            }
            peer
        });

        let callers = (0..k)
            .map(|i| {
                let connection = connection.clone();
                thread::spawn(move || {
                    let request = Message::new(MessageType::Select, vec![i as u8]);
                    let response = connection.send(&request).unwrap();
                    (request, response)
                })
            })
            .collect::<Vec<_>>();

        for caller in callers {
            let (request, response) = caller.join().unwrap();
            assert_eq!(response.id(), request.id());
            assert_eq!(response.body(), request.body());
        }
        assert_eq!(connection.pending_requests(), 0);
        let _peer = responder.join().unwrap();
    }

    #[test]
    fn send_times_out_and_clears_slot() {
        let timeout = Duration::from_millis(200);
        let (connection, mut peer) = pair(timeout);

        let request = Message::new(MessageType::Select, vec![]);
        let started = Instant::now();
        let err = connection.send(&request).unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, ConnectionError::Timeout { id, .. } if id == request.id()));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
        assert_eq!(connection.pending_requests(), 0);

        // A late response finds no waiter and leaves the connection usable.
        let received = peer.read_message().unwrap();
        peer.write_message(&Message::reply(&received, MessageType::Select, vec![]))
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!connection.is_closed());
        assert_eq!(connection.pending_requests(), 0);
    }

    #[test]
    fn late_response_never_reaches_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut peer = ProtocolTransport::new(server);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let connection = Connection::new(
            Stream::plain(client),
            ConnectionOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .unwrap();
        connection
            .listen_with_callback(Arc::new(move |_: &Connection, message: Message| {
                tx.lock().send(message).unwrap();
            }))
            .unwrap();

        let request = Message::new(MessageType::Select, vec![]);
        assert!(matches!(
            connection.send(&request),
            Err(ConnectionError::Timeout { .. })
        ));
        let received = peer.read_message().unwrap();
        peer.write_message(&Message::reply(&received, MessageType::Select, vec![]))
            .unwrap();

        // A frame that really is unsolicited still gets through, after the late one.
        let pushed = Message::new(MessageType::Commit, vec![]);
        peer.write_message(&pushed).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), pushed);
        assert!(rx.try_recv().is_err());
        assert!(!connection.is_closed());
    }

    #[test]
    fn close_releases_writer_blocked_on_full_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        // Never read from, so the socket and then the queue fill up.
        let (_silent, _) = listener.accept().unwrap();

        let connection = Connection::new(
            Stream::plain(client),
            ConnectionOptions::default().with_queue_capacity(1),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel();
        let producer = {
            let connection = connection.clone();
            thread::spawn(move || {
                loop {
                    let result = connection.write(vec![0; 1024 * 1024]);
                    if result.is_err() {
                        tx.send(result).unwrap();
                        return;
                    }
                }
            })
        };

        // Let the producer run until it blocks.
        thread::sleep(Duration::from_millis(500));
        assert!(rx.try_recv().is_err());
        connection.close().unwrap();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
        producer.join().unwrap();
    }

    #[test]
    fn duplicate_in_flight_id_is_rejected() {
        let (connection, mut peer) = pair(Duration::from_millis(500));
        let request = Message::new(MessageType::Select, vec![]);

        let first = {
            let connection = connection.clone();
            let request = request.clone();
            thread::spawn(move || connection.send(&request))
        };
        let _ = peer.read_message().unwrap();
        while connection.pending_requests() == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(
            connection.send(&request),
            Err(ConnectionError::DuplicateId(_))
        ));
        assert!(matches!(
            first.join().unwrap(),
            Err(ConnectionError::Timeout { .. })
        ));
    }

    #[test]
    fn unsolicited_frames_reach_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut peer = ProtocolTransport::new(server);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let connection =
            Connection::new(Stream::plain(client), ConnectionOptions::default()).unwrap();
        connection
            .listen_with_callback(Arc::new(move |_: &Connection, message: Message| {
                tx.lock().send(message).unwrap();
            }))
            .unwrap();

        let pushed = Message::new(MessageType::Insert, b"row".to_vec());
        peer.write_message(&pushed).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, pushed);
        assert!(matches!(
            connection.listen(),
            Err(ConnectionError::AlreadyListening)
        ));
    }

    #[test]
    fn close_is_idempotent_and_fails_writes() {
        let (connection, _peer) = pair(Duration::from_secs(1));

        connection.close().unwrap();
        connection.close().unwrap();

        assert!(connection.is_closed());
        assert!(connection.wait_closed(Duration::from_millis(10)));
        assert!(matches!(
            connection.write(vec![1, 2, 3]),
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(
            connection.send(&Message::new(MessageType::Ping, vec![])),
            Err(ConnectionError::Closed)
        ));
    }

    #[test]
    fn peer_disconnect_closes_connection() {
        let (connection, peer) = pair(Duration::from_secs(1));
        drop(peer);

        assert!(connection.wait_closed(Duration::from_secs(5)));
        assert!(connection.write(vec![0]).is_err());
    }

    #[test]
    fn framing_error_closes_connection() {
        let (connection, peer) = pair(Duration::from_secs(1));
        let mut raw = peer.into_inner();

        // Header announcing more body than is ever sent, then EOF.
        let message = Message::new(MessageType::Insert, vec![0; 64]);
        std::io::Write::write_all(&mut raw, &message.to_bytes()[..40]).unwrap();
        raw.shutdown(std::net::Shutdown::Write).unwrap();

        assert!(connection.wait_closed(Duration::from_secs(5)));
    }

    #[test]
    fn identity_is_by_handle() {
        let (a, _pa) = pair(Duration::from_secs(1));
        let (b, _pb) = pair(Duration::from_secs(1));

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }
}
