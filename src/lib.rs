pub mod cluster;
pub mod protocol;

pub use cluster::{ClientConfig, MessageClient, MessageServer, NodeRegistry, ServerConfig};
pub use protocol::{Connection, Message, MessageType};
