//! WebSocket transport to a hosted realtime service, using `tokio-tungstenite`.
//!
//! Both `ws://` and `wss://` URLs are supported; TLS is handled by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream). Hosted realtime
//! services authenticate the socket with a public API key passed in the query
//! string, which [`WebSocketTransport::connect`] appends for you.
//!
//! # Feature gate
//!
//! Only available with the `transport-websocket` feature (enabled by default).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::DuelError;
use crate::transport::Transport;

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Append the API key to the socket URL as `apikey=<key>`.
fn endpoint(url: &str, api_key: Option<&str>) -> String {
    match api_key {
        Some(key) if url.contains('?') => format!("{url}&apikey={key}"),
        Some(key) => format!("{url}?apikey={key}"),
        None => url.to_owned(),
    }
}

/// A [`Transport`] backed by a WebSocket connection.
///
/// Text frames carry JSON. Services that send JSON in binary frames are also
/// accepted as long as the payload is valid UTF-8.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Connect to the realtime endpoint at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DuelError::Io`] if the URL is invalid or the connection cannot
    /// be established. I/O error kinds are preserved; every other failure
    /// maps to [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str, api_key: Option<&str>) -> Result<Self, DuelError> {
        let target = endpoint(url, api_key);
        tracing::debug!(url = %url, "connecting to realtime endpoint");

        let (stream, _response) = tokio_tungstenite::connect_async(target.as_str())
            .await
            .map_err(|e| {
                let kind = match &e {
                    tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                    _ => std::io::ErrorKind::Other,
                };
                DuelError::Io(std::io::Error::new(kind, e))
            })?;

        tracing::info!(url = %url, "realtime connection established");

        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established stream (custom TLS, proxies, headers).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// [`connect`](Self::connect) bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DuelError::Timeout`] if the deadline elapses, or any error
    /// [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        url: &str,
        api_key: Option<&str>,
        timeout: std::time::Duration,
    ) -> Result<Self, DuelError> {
        tokio::time::timeout(timeout, Self::connect(url, api_key))
            .await
            .map_err(|_| DuelError::Timeout)?
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<(), DuelError> {
        if self.closed {
            return Err(DuelError::TransportClosed);
        }
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| DuelError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, DuelError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(DuelError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::warn!("skipping non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), DuelError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| DuelError::TransportSend(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one WebSocket connection, run `handler` on it, and return the URL.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}/socket")
    }

    #[test]
    fn api_key_is_appended_to_the_query() {
        assert_eq!(
            endpoint("wss://rt.example.com/socket", Some("k1")),
            "wss://rt.example.com/socket?apikey=k1"
        );
        assert_eq!(
            endpoint("wss://rt.example.com/socket?vsn=1.0.0", Some("k1")),
            "wss://rt.example.com/socket?vsn=1.0.0&apikey=k1"
        );
        assert_eq!(endpoint("ws://x/socket", None), "ws://x/socket");
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DuelError::Io(_)));
    }

    #[tokio::test]
    async fn binary_json_frames_are_accepted() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Binary(br#"{"type":"Error"}"#.to_vec().into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url, Some("anon")).await.unwrap();
        let text = transport.recv().await.unwrap().unwrap();
        assert_eq!(text, r#"{"type":"Error"}"#);
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn frames_round_trip_through_an_echo_server() {
        let url = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url, None).await.unwrap();
        transport.send("frame".to_string()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "frame");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = WebSocketTransport::connect(&url, None).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, DuelError::TransportClosed));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        let result = WebSocketTransport::connect_with_timeout(
            "ws://192.0.2.1:1",
            None,
            std::time::Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result.unwrap_err(), DuelError::Timeout));
    }
}
