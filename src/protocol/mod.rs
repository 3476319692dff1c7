//! Node-to-node wire protocol: 24 byte big-endian frame headers, typed control payloads,
//! plain and TLS sockets, and the duplex [`Connection`] that correlates concurrent requests
//! over one socket.
pub mod connection;
mod message;
mod payload;
pub mod stream;
pub mod thread;
mod transport;

pub use connection::{Callback, Connection, ConnectionError, ConnectionId, ConnectionOptions};
pub use message::{
    HEADER_SIZE, Header, HeaderError, Message, MessageCategory, MessageId, MessageType,
};
pub use payload::{ErrorCode, ErrorReply, JoinRequest, Payload, PayloadError};
pub use stream::{ClientTls, Stream, TlsError, TlsFiles};
pub use thread::ThreadPool;
pub use transport::{MAX_BODY_SIZE, ProtocolTransport, TransportError};
