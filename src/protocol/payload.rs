use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};
use thiserror::Error;

use super::message::{Message, MessageType};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("failed to encode payload: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode payload: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("{trailing} trailing bytes after {message_type:?} payload")]
    Trailing {
        message_type: MessageType,
        trailing: usize,
    },
    #[error("{0:?} messages carry no body, got {1} bytes")]
    UnexpectedBody(MessageType, usize),
    #[error("message type {0:?} is not understood")]
    Unknown(MessageType),
}

pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Join request sent as the body of a [`MessageType::Greeting`].
///
/// `digest` is the hex encoded HMAC-SHA256 of the remaining fields; see
/// [`crate::cluster::auth`].
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct JoinRequest {
    pub digest: String,
    pub node_id: String,
    pub tags: Vec<String>,
    /// Unix time in milliseconds at which the request was signed.
    pub timestamp: u64,
    pub is_replica: bool,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ErrorCode {
    Handler,
    Unsupported,
    Malformed,
}

/// Body of a [`MessageType::Error`] reply.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub description: String,
}

/// Typed view over a message body, resolved from the message type.
///
/// Only control payloads are interpreted here. Statement bodies belong to the statement
/// layer and are carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Greeting(JoinRequest),
    Welcome,
    Ping,
    Pong,
    Error(ErrorReply),
    Statement { kind: MessageType, body: Vec<u8> },
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Greeting(_) => MessageType::Greeting,
            Payload::Welcome => MessageType::Welcome,
            Payload::Ping => MessageType::Ping,
            Payload::Pong => MessageType::Pong,
            Payload::Error(_) => MessageType::Error,
            Payload::Statement { kind, .. } => *kind,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let body = match self {
            Payload::Greeting(join) => bincode::encode_to_vec(join, wire_config())?,
            Payload::Error(reply) => bincode::encode_to_vec(reply, wire_config())?,
            Payload::Welcome | Payload::Ping | Payload::Pong => Vec::new(),
            Payload::Statement { body, .. } => body.clone(),
        };
        Ok(body)
    }

    pub fn decode(message_type: MessageType, body: &[u8]) -> Result<Self, PayloadError> {
        match message_type {
            MessageType::Greeting => Ok(Payload::Greeting(decode_exact(message_type, body)?)),
            MessageType::Error => Ok(Payload::Error(decode_exact(message_type, body)?)),
            MessageType::Welcome => empty(message_type, body).map(|_| Payload::Welcome),
            MessageType::Ping => empty(message_type, body).map(|_| Payload::Ping),
            MessageType::Pong => empty(message_type, body).map(|_| Payload::Pong),
            MessageType::Unknown(_) => Err(PayloadError::Unknown(message_type)),
            kind => Ok(Payload::Statement {
                kind,
                body: body.to_vec(),
            }),
        }
    }
}

fn decode_exact<T: Decode<()>>(message_type: MessageType, body: &[u8]) -> Result<T, PayloadError> {
    let (value, read) = bincode::decode_from_slice(body, wire_config())?;
    if read != body.len() {
        return Err(PayloadError::Trailing {
            message_type,
            trailing: body.len() - read,
        });
    }
    Ok(value)
}

fn empty(message_type: MessageType, body: &[u8]) -> Result<(), PayloadError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(PayloadError::UnexpectedBody(message_type, body.len()))
    }
}

impl Message {
    pub fn from_payload(payload: &Payload) -> Result<Self, PayloadError> {
        Ok(Message::new(payload.message_type(), payload.encode()?))
    }

    pub fn reply_with(request: &Message, payload: &Payload) -> Result<Self, PayloadError> {
        Ok(Message::reply(
            request,
            payload.message_type(),
            payload.encode()?,
        ))
    }

    pub fn payload(&self) -> Result<Payload, PayloadError> {
        Payload::decode(self.message_type(), self.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join() -> JoinRequest {
        JoinRequest {
            digest: "00".repeat(32),
            node_id: "node-a".into(),
            tags: vec!["east".into(), "ssd".into()],
            timestamp: 1_700_000_000_000,
            is_replica: true,
        }
    }

    #[test]
    fn greeting_payload() {
        let payload = Payload::Greeting(join());
        let message = Message::from_payload(&payload).unwrap();

        assert_eq!(message.message_type(), MessageType::Greeting);
        assert_eq!(message.payload().unwrap(), payload);
    }

    #[test]
    fn error_reply_is_correlated() {
        let request = Message::new(MessageType::Insert, vec![1, 2, 3]);
        let reply = Message::reply_with(
            &request,
            &Payload::Error(ErrorReply {
                code: ErrorCode::Handler,
                description: "table missing".into(),
            }),
        )
        .unwrap();

        assert_eq!(reply.id(), request.id());
        match reply.payload().unwrap() {
            Payload::Error(ErrorReply { code, description }) => {
                assert_eq!(code, ErrorCode::Handler);
                assert_eq!(description, "table missing");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn statement_bodies_are_opaque() {
        let message = Message::new(MessageType::Select, vec![0xde, 0xad]);

        assert_eq!(
            message.payload().unwrap(),
            Payload::Statement {
                kind: MessageType::Select,
                body: vec![0xde, 0xad]
            }
        );
    }

    #[test]
    fn ping_with_body_is_rejected() {
        let err = Payload::decode(MessageType::Ping, &[1]).unwrap_err();
        assert!(matches!(err, PayloadError::UnexpectedBody(MessageType::Ping, 1)));
    }

    #[test]
    fn truncated_greeting_is_rejected() {
        let body = Payload::Greeting(join()).encode().unwrap();
        assert!(Payload::decode(MessageType::Greeting, &body[..body.len() - 1]).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut body = Payload::Greeting(join()).encode().unwrap();
        body.push(0);

        let err = Payload::decode(MessageType::Greeting, &body).unwrap_err();
        assert!(matches!(err, PayloadError::Trailing { trailing: 1, .. }));
    }

    #[test]
    fn unknown_type_is_left_to_caller() {
        let err = Payload::decode(MessageType::Unknown(9), &[]).unwrap_err();
        assert!(matches!(err, PayloadError::Unknown(MessageType::Unknown(9))));
    }
}
