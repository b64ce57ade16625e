//! Transport implementations for the realtime service.
//!
//! | Feature                | Transport                                   |
//! |------------------------|---------------------------------------------|
//! | *(always)*             | [`MemoryTransport`] via [`MemoryHub`]       |
//! | `transport-websocket`  | `WebSocketTransport`                        |
//!
//! # Example
//!
//! ```rust,ignore
//! # async fn example() -> Result<(), duel_sync::DuelError> {
//! use duel_sync::{Transport, WebSocketTransport};
//!
//! let mut ws = WebSocketTransport::connect("wss://realtime.example.com/socket", Some("anon-key")).await?;
//! ws.send(r#"{"type":"Leave","data":{"topic":"presence-changes"}}"#.to_string()).await?;
//! ws.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod memory;

#[cfg(feature = "transport-websocket")]
pub mod websocket;

pub use memory::{MemoryHub, MemoryTransport};

#[cfg(feature = "transport-websocket")]
pub use websocket::WebSocketTransport;
