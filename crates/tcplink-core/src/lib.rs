//! tcplink core types
//!
//! Status enums, events, errors, and configuration shared by the TCP client
//! and server. This crate is the single source of truth for the event
//! vocabulary that upper layers subscribe to, independent of role.

pub mod config;
pub mod error;
pub mod events;
pub mod status;

pub use config::{ClientConfig, LinkConfig, ServerConfig, SocketConfig};
pub use error::{LinkError, LinkState, Result, is_transport_error};
pub use events::{
    ConnectedEvent, DataReceivedEvent, DisconnectReason, DisconnectedEvent, ErrorEvent, EventBus,
    LinkEvent, ServerStartedEvent, ServerStoppedEvent,
};
pub use status::{ConnectionStatus, ServerStatus};
