//! Message identity and framing.
//!
//! Every frame on the wire is a fixed [`HEADER_SIZE`] byte [`Header`] followed by an opaque
//! body. The header carries the 128-bit [`MessageId`] used for request/response correlation,
//! the [`MessageType`] discriminant and the body length. All integers are big-endian:
//!
//! ```text
//! [0:16)  message id
//! [16:20) message type (u32)
//! [20:24) body size (u32)
//! ```
use std::fmt;

use thiserror::Error;
use uuid::Uuid;

pub const HEADER_SIZE: usize = 24;

const ID_SIZE: usize = 16;
const TYPE_OFFSET: usize = ID_SIZE;
const SIZE_OFFSET: usize = TYPE_OFFSET + size_of::<u32>();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header must be exactly {HEADER_SIZE} bytes, got {0}")]
    Length(usize),
    #[error("body of {0} bytes does not fit in a frame")]
    BodyTooLarge(usize),
}

/// Unique identifier of a message; responses echo the id of their request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        self.0.as_bytes()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broad grouping of the message type space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    DatabaseDefinition,
    TableDefinition,
    IndexDefinition,
    DataManipulation,
    Transaction,
    Utility,
    Unknown,
}

/// Semantic operation carried by a frame.
///
/// Values are grouped by category in the high byte of the low half-word. Anything the
/// table below does not name decodes to [`MessageType::Unknown`] with its raw value kept,
/// so decoding never fails on a type this build does not know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    CreateDatabase,
    DropDatabase,
    UseDatabase,
    ShowDatabases,

    CreateTable,
    DropTable,
    AlterTable,
    ShowTables,
    DescribeTable,

    CreateIndex,
    DropIndex,

    Insert,
    Select,
    Update,
    Delete,

    Begin,
    Commit,
    Rollback,

    Ping,
    Pong,
    /// Join request sent by a node that wants to become a cluster connection.
    Greeting,
    /// Positive acknowledgment of a [`MessageType::Greeting`].
    Welcome,
    /// Application level failure reply.
    Error,

    Unknown(u32),
}

impl MessageType {
    pub fn category(&self) -> MessageCategory {
        match self {
            Self::CreateDatabase | Self::DropDatabase | Self::UseDatabase | Self::ShowDatabases => {
                MessageCategory::DatabaseDefinition
            }
            Self::CreateTable
            | Self::DropTable
            | Self::AlterTable
            | Self::ShowTables
            | Self::DescribeTable => MessageCategory::TableDefinition,
            Self::CreateIndex | Self::DropIndex => MessageCategory::IndexDefinition,
            Self::Insert | Self::Select | Self::Update | Self::Delete => {
                MessageCategory::DataManipulation
            }
            Self::Begin | Self::Commit | Self::Rollback => MessageCategory::Transaction,
            Self::Ping | Self::Pong | Self::Greeting | Self::Welcome | Self::Error => {
                MessageCategory::Utility
            }
            Self::Unknown(_) => MessageCategory::Unknown,
        }
    }

    /// Whether the body of this type belongs to the statement layer.
    pub fn is_statement(&self) -> bool {
        !matches!(
            self.category(),
            MessageCategory::Utility | MessageCategory::Unknown
        )
    }
}

impl From<u32> for MessageType {
    fn from(value: u32) -> Self {
        match value {
            0x0101 => Self::CreateDatabase,
            0x0102 => Self::DropDatabase,
            0x0103 => Self::UseDatabase,
            0x0104 => Self::ShowDatabases,
            0x0201 => Self::CreateTable,
            0x0202 => Self::DropTable,
            0x0203 => Self::AlterTable,
            0x0204 => Self::ShowTables,
            0x0205 => Self::DescribeTable,
            0x0301 => Self::CreateIndex,
            0x0302 => Self::DropIndex,
            0x0401 => Self::Insert,
            0x0402 => Self::Select,
            0x0403 => Self::Update,
            0x0404 => Self::Delete,
            0x0501 => Self::Begin,
            0x0502 => Self::Commit,
            0x0503 => Self::Rollback,
            0x0601 => Self::Ping,
            0x0602 => Self::Pong,
            0x0603 => Self::Greeting,
            0x0604 => Self::Welcome,
            0x0605 => Self::Error,
            other => Self::Unknown(other),
        }
    }
}

impl From<MessageType> for u32 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::CreateDatabase => 0x0101,
            MessageType::DropDatabase => 0x0102,
            MessageType::UseDatabase => 0x0103,
            MessageType::ShowDatabases => 0x0104,
            MessageType::CreateTable => 0x0201,
            MessageType::DropTable => 0x0202,
            MessageType::AlterTable => 0x0203,
            MessageType::ShowTables => 0x0204,
            MessageType::DescribeTable => 0x0205,
            MessageType::CreateIndex => 0x0301,
            MessageType::DropIndex => 0x0302,
            MessageType::Insert => 0x0401,
            MessageType::Select => 0x0402,
            MessageType::Update => 0x0403,
            MessageType::Delete => 0x0404,
            MessageType::Begin => 0x0501,
            MessageType::Commit => 0x0502,
            MessageType::Rollback => 0x0503,
            MessageType::Ping => 0x0601,
            MessageType::Pong => 0x0602,
            MessageType::Greeting => 0x0603,
            MessageType::Welcome => 0x0604,
            MessageType::Error => 0x0605,
            MessageType::Unknown(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: MessageId,
    pub message_type: MessageType,
    pub body_size: u32,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0; HEADER_SIZE];
        out[..ID_SIZE].copy_from_slice(self.id.as_bytes());
        out[TYPE_OFFSET..SIZE_OFFSET].copy_from_slice(&u32::from(self.message_type).to_be_bytes());
        out[SIZE_OFFSET..].copy_from_slice(&self.body_size.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        let bytes: &[u8; HEADER_SIZE] = bytes
            .try_into()
            .map_err(|_| HeaderError::Length(bytes.len()))?;

        let mut id = [0; ID_SIZE];
        id.copy_from_slice(&bytes[..ID_SIZE]);
        let mut message_type = [0; 4];
        message_type.copy_from_slice(&bytes[TYPE_OFFSET..SIZE_OFFSET]);
        let mut body_size = [0; 4];
        body_size.copy_from_slice(&bytes[SIZE_OFFSET..]);

        Ok(Self {
            id: MessageId::from_bytes(id),
            message_type: u32::from_be_bytes(message_type).into(),
            body_size: u32::from_be_bytes(body_size),
        })
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    body: Vec<u8>,
}

impl Message {
    /// Builds a message with a freshly generated id.
    ///
    /// # Panics
    /// If `body` is longer than `u32::MAX` bytes. Use [`Message::try_new`] for untrusted sizes.
    pub fn new(message_type: MessageType, body: Vec<u8>) -> Self {
        Self::with_id(MessageId::generate(), message_type, body)
    }

    pub fn try_new(message_type: MessageType, body: Vec<u8>) -> Result<Self, HeaderError> {
        if u32::try_from(body.len()).is_err() {
            return Err(HeaderError::BodyTooLarge(body.len()));
        }
        Ok(Self::new(message_type, body))
    }

    /// Builds a response to `request`, echoing its id.
    pub fn reply(request: &Message, message_type: MessageType, body: Vec<u8>) -> Self {
        Self::with_id(request.id(), message_type, body)
    }

    pub(crate) fn with_id(id: MessageId, message_type: MessageType, body: Vec<u8>) -> Self {
        let body_size = u32::try_from(body.len()).expect("message body exceeds u32::MAX bytes");
        Self {
            header: Header {
                id,
                message_type,
                body_size,
            },
            body,
        }
    }

    /// Reassembles a frame read from a stream. The caller guarantees `body` holds exactly
    /// `header.body_size` bytes.
    pub(crate) fn from_parts(header: Header, body: Vec<u8>) -> Self {
        debug_assert_eq!(header.body_size as usize, body.len());
        Self { header, body }
    }

    pub fn id(&self) -> MessageId {
        self.header.id
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn header_round_trip() {
        let headers = [
            Header {
                id: MessageId::generate(),
                message_type: MessageType::Insert,
                body_size: 0,
            },
            Header {
                id: MessageId::from_bytes([0xff; 16]),
                message_type: MessageType::Unknown(u32::MAX),
                body_size: u32::MAX,
            },
            Header {
                id: MessageId::from_bytes([0; 16]),
                message_type: MessageType::Ping,
                body_size: 1024,
            },
        ];

        for header in headers {
            let bytes = header.to_bytes();
            assert_eq!(bytes.len(), HEADER_SIZE);
            assert_eq!(Header::from_bytes(&bytes).unwrap(), header);
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let header = Header {
            id: MessageId::from_bytes([7; 16]),
            message_type: MessageType::Pong,
            body_size: 0x01020304,
        };
        let bytes = header.to_bytes();

        assert_eq!(&bytes[..16], &[7; 16]);
        assert_eq!(&bytes[16..20], &[0x00, 0x00, 0x06, 0x02]);
        assert_eq!(&bytes[20..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn header_rejects_wrong_length() {
        for len in [0, 1, 23, 25, 48] {
            let bytes = vec![0; len];
            assert_eq!(Header::from_bytes(&bytes), Err(HeaderError::Length(len)));
        }
    }

    #[test]
    fn unknown_type_is_tagged_not_rejected() {
        let ty: MessageType = 0xdead.into();
        assert_eq!(ty, MessageType::Unknown(0xdead));
        assert_eq!(ty.category(), MessageCategory::Unknown);
        assert_eq!(u32::from(ty), 0xdead);
    }

    #[test]
    fn message_type_categories() {
        assert_eq!(
            MessageType::CreateDatabase.category(),
            MessageCategory::DatabaseDefinition
        );
        assert_eq!(
            MessageType::DescribeTable.category(),
            MessageCategory::TableDefinition
        );
        assert_eq!(
            MessageType::DropIndex.category(),
            MessageCategory::IndexDefinition
        );
        assert_eq!(
            MessageType::Select.category(),
            MessageCategory::DataManipulation
        );
        assert_eq!(MessageType::Rollback.category(), MessageCategory::Transaction);
        assert_eq!(MessageType::Welcome.category(), MessageCategory::Utility);
        assert!(MessageType::Commit.is_statement());
        assert!(!MessageType::Ping.is_statement());
    }

    #[test]
    fn message_to_bytes_appends_body() {
        let message = Message::new(MessageType::Select, b"rows".to_vec());
        let bytes = message.to_bytes();

        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        let header = Header::from_bytes(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(header.id, message.id());
        assert_eq!(header.body_size, 4);
        assert_eq!(&bytes[HEADER_SIZE..], b"rows");
    }

    #[test]
    fn reply_echoes_request_id() {
        let request = Message::new(MessageType::Ping, vec![]);
        let response = Message::reply(&request, MessageType::Pong, vec![]);

        assert_eq!(request.id(), response.id());
        assert_eq!(response.message_type(), MessageType::Pong);
    }

    #[test]
    fn concurrent_ids_are_distinct() {
        let ids = Arc::new(Mutex::new(HashSet::new()));
        let handles = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let message = Message::new(MessageType::Ping, vec![]);
                        ids.lock().insert(message.id());
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ids.lock().len(), 8 * 500);
    }
}
