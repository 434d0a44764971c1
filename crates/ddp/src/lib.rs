//! # DDP Protocol Engine
//!
//! Server side of DDP, the handshake + method RPC + reactive publish/subscribe
//! protocol, independent of any particular socket library.
//!
//! This crate provides:
//! - **Protocol types**: client and server envelopes, the JSON codec, wire errors
//! - **Connections**: handshake, keepalive and ordered dispatch via [`serve_connection`]
//! - **Methods**: the [`MethodHandler`] trait and result/updated completion
//! - **Publications**: the [`PublicationHandler`] trait, [`Subscription`] handles
//!   and the per-connection [`MergeBox`]
//! - **Registry**: live-connection admission, owned by a [`Server`]
//!
//! Used by `ddp_server`, which puts it behind an axum WebSocket endpoint.

pub mod config;
pub mod connection;
pub mod error;
pub mod id;
pub mod merge_box;
pub mod method;
pub mod protocol;
pub mod publication;
pub mod registry;
pub mod server;
pub mod subscription;
pub mod transport;

pub use config::{ConnectionConfig, ServerOptions};
pub use connection::serve_connection;
pub use error::{ConnectionError, DdpError, PublishError, TransportError};
pub use merge_box::MergeBox;
pub use method::{MethodHandler, MethodInvocation};
pub use protocol::{ClientMessage, Fields, ServerMessage};
pub use publication::{PublicationHandler, Subscription};
pub use server::{Server, ServerBuilder};
pub use transport::Frame;
