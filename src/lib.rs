//! chat-channel - Persistent real-time messaging channel
//!
//! Maintains one logical duplex connection to the chat message server,
//! survives transient network failure, and guarantees no outbound message
//! is silently dropped while the channel is unavailable.
//!
//! # Architecture
//!
//! The crate is organized by concern, each module with a single
//! responsibility:
//!
//! | Module      | Responsibility                                    |
//! |-------------|---------------------------------------------------|
//! | `transport` | WebSocket connect/send/receive                    |
//! | `envelope`  | Wire format, JSON encoding, validation            |
//! | `manager`   | Lifecycle, outbound queue, reconnection, fan-out  |
//! | `config`    | Connection and reconnection policy settings       |
//! | `error`     | Error taxonomy                                    |
//!
//! # Usage
//!
//! ```ignore
//! use chat_channel::{ConnectionManager, Envelope, ManagerConfig};
//!
//! let manager = ConnectionManager::new(ManagerConfig {
//!     server_url: "ws://chat.example.com/ws".to_string(),
//!     ..Default::default()
//! });
//!
//! manager.on_message(|envelope| {
//!     println!("inbound: {:?}", envelope);
//! }).await;
//!
//! // Queued until the channel opens; nothing is lost.
//! manager.send(Envelope::private(1, 2, "hi")).await?;
//!
//! manager.connect(1).await?;
//! ```
//!
//! # Key Design Points
//!
//! - **Sends never disappear**: envelopes issued while the channel is down
//!   are queued and flushed in FIFO order on the next successful open,
//!   right after the presence announcement.
//! - **Bounded automatic recovery**: an unexpected close schedules a
//!   cancellable reconnect timer; the budget resets on every successful
//!   open and exhaustion is a caller-visible state, never a crash.
//! - **Explicit identity**: the session identity is passed to `connect`,
//!   not pulled from ambient state.

pub mod config;
pub mod envelope;
pub mod error;
pub mod manager;
pub mod transport;

pub use config::ManagerConfig;
pub use envelope::{Envelope, EnvelopeKind};
pub use error::ChannelError;
pub use manager::{ConnectionManager, ConnectionState, MessageHandler};
pub use transport::{Connector, FrameSink, FrameStream, Transport, WsConnector};
