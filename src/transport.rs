//! Transport abstraction for the realtime service.
//!
//! The [`Transport`] trait is one bidirectional text pipe between this client
//! and the realtime service. Every channel (ephemeral broadcast or change
//! feed) is multiplexed over it by [`Realtime`](crate::realtime::Realtime):
//! the transport only moves serialized [`ClientFrame`](crate::protocol::ClientFrame)s
//! out and [`ServerFrame`](crate::protocol::ServerFrame)s in.
//!
//! Connection setup is not part of this trait. Build a connected transport
//! (a WebSocket, an in-process [`MemoryHub`](crate::transports::MemoryHub)
//! connection, ...) and hand it to [`DuelClient::start`](crate::DuelClient::start).
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use duel_sync::error::DuelError;
//! use duel_sync::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: String) -> Result<(), DuelError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, DuelError>> {
//!         // `None` when the service closed the connection cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), DuelError> {
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::DuelError;

/// A bidirectional text frame transport to the realtime service.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON frame and
/// each call to [`recv`](Transport::recv) yields one.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe: the realtime loop polls it
/// inside `tokio::select!`, and a cancelled call must not lose a frame.
/// Channel-backed implementations (wrapping `mpsc::Receiver`) are naturally
/// cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one JSON frame.
    ///
    /// # Errors
    ///
    /// Returns [`DuelError::TransportSend`] if the frame could not be written,
    /// or [`DuelError::TransportClosed`] after [`close`](Transport::close).
    async fn send(&mut self, frame: String) -> Result<(), DuelError>;

    /// Receive the next JSON frame.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame
    /// - `Some(Err(e))`: a transport error, after which the connection is unusable
    /// - `None`: the service closed the connection cleanly
    async fn recv(&mut self) -> Option<Result<String, DuelError>>;

    /// Close the connection. Idempotent; resources are released even if the
    /// close handshake fails.
    async fn close(&mut self) -> Result<(), DuelError>;
}
