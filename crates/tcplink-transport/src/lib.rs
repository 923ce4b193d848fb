//! TCP transport for tcplink.
//!
//! Provides an async TCP client and a multi-connection TCP server. Both
//! publish lifecycle and data events through a broadcast [`EventBus`]:
//! - Connection lifecycle (connect, disconnect with a reason)
//! - Raw received bytes, unframed
//! - Errors, which are also returned from the failing call
//!
//! [`EventBus`]: tcplink_core::EventBus

pub mod client;
pub mod connection;
pub mod server;
mod socket;

pub use client::TcpClient;
pub use connection::ConnectionInfo;
pub use server::TcpServer;
