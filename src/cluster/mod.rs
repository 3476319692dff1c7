//! Cluster membership and the two ends of a cluster link.
//!
//! A node joins by dialing a [`MessageServer`] and proving knowledge of the shared secret
//! (see [`auth`]). The server keeps every authenticated socket in its [`NodeRegistry`],
//! partitioned into masters and slaves, and can broadcast to all slaves at once. The dialing
//! side keeps an elastic pool of such sockets in a [`MessageClient`].
pub mod auth;
pub mod client;
pub mod node;
pub mod server;

pub use auth::{AuthError, JoinValidator};
pub use client::{ClientConfig, ClientError, MessageClient};
pub use node::{Node, NodeRegistry, Role};
pub use server::{
    BroadcastReport, Delivery, HandlerError, MessageHandler, MessageServer, ServerCallbacks,
    ServerConfig, ServerError,
};
