use std::io::{self, Read, Write};

use thiserror::Error;

use super::{
    Message,
    message::{HEADER_SIZE, Header, HeaderError},
};

/// Largest body a peer may announce; larger frames are treated as corrupt.
pub const MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed header: {0}")]
    Header(#[from] HeaderError),
    #[error("frame announces {declared} body bytes, limit is {MAX_BODY_SIZE}")]
    Oversized { declared: u32 },
    #[error("stream ended after {read} of {declared} body bytes")]
    ShortBody { declared: u32, read: usize },
    #[error("connection closed by peer")]
    Eof,
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Errors that end a read loop quietly instead of being reported as failures.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Eof => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Frame reader/writer over any byte stream.
pub struct ProtocolTransport<T> {
    stream: T,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: Read> ProtocolTransport<T> {
    pub fn read_message(&mut self) -> Result<Message, TransportError> {
        let mut header = [0; HEADER_SIZE];
        read_header(&mut self.stream, &mut header)?;
        let header = Header::from_bytes(&header)?;

        if header.body_size > MAX_BODY_SIZE {
            return Err(TransportError::Oversized {
                declared: header.body_size,
            });
        }

        let mut body = vec![0; header.body_size as usize];
        let mut read = 0;
        while read < body.len() {
            match self.stream.read(&mut body[read..]) {
                Ok(0) => {
                    return Err(TransportError::ShortBody {
                        declared: header.body_size,
                        read,
                    });
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Message::from_parts(header, body))
    }
}

impl<T: Write> ProtocolTransport<T> {
    pub fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        self.write_frame(&message.to_bytes())
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Reads a full header. A clean end of stream before the first byte is reported as
/// [`TransportError::Eof`]; ending part way through is a framing error.
fn read_header<R: Read>(stream: &mut R, buf: &mut [u8; HEADER_SIZE]) -> Result<(), TransportError> {
    let mut read = 0;
    while read < HEADER_SIZE {
        match stream.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Err(TransportError::Eof),
            Ok(0) => return Err(HeaderError::Length(read).into()),
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
