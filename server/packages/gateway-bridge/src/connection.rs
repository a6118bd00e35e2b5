use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use gateway_bridge_error::BridgeError;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::frame::{Frame, FrameError};

type GatewaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Ready,
    Closed,
}

/// The single gateway socket owned by one bridged request.
#[derive(Debug)]
pub struct GatewayConnection {
    socket: Option<GatewaySocket>,
    state: ConnectionState,
    url: String,
    opened_at: Instant,
    frames_in: u64,
    frames_out: u64,
}

impl GatewayConnection {
    pub async fn open(url: &str, connect_timeout: Duration) -> Result<Self, BridgeError> {
        let start = Instant::now();
        tracing::info!(url = %url, "opening gateway connection");

        let socket = match tokio::time::timeout(connect_timeout, connect_async(url)).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(err)) => {
                tracing::warn!(url = %url, error = %err, "gateway connection failed");
                return Err(BridgeError::ConnectFailed {
                    url: url.to_string(),
                    message: err.to_string(),
                });
            }
            Err(_) => {
                tracing::warn!(
                    url = %url,
                    timeout_ms = connect_timeout.as_millis() as u64,
                    "gateway connection timed out"
                );
                return Err(BridgeError::ConnectTimeout {
                    url: url.to_string(),
                    timeout_ms: connect_timeout.as_millis() as u64,
                });
            }
        };

        tracing::info!(
            url = %url,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "gateway connection open"
        );

        Ok(Self {
            socket: Some(socket),
            state: ConnectionState::Handshaking,
            url: url.to_string(),
            opened_at: start,
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn mark_ready(&mut self) {
        if self.state == ConnectionState::Handshaking {
            self.state = ConnectionState::Ready;
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), BridgeError> {
        let text = frame.encode().map_err(|err| BridgeError::StreamError {
            message: err.to_string(),
        })?;
        let Some(socket) = self.socket.as_mut() else {
            return Err(BridgeError::ConnectionClosed);
        };

        tracing::debug!(kind = frame.kind(), bytes = text.len(), "gateway: sending frame");
        socket.send(Message::text(text)).await.map_err(|err| {
            tracing::warn!(error = %err, "gateway: send failed");
            BridgeError::ConnectionClosed
        })?;
        self.frames_out += 1;
        Ok(())
    }

    /// Next frame from the gateway, or `None` once the socket is closed.
    ///
    /// Control messages are skipped. Decode failures are returned to the
    /// caller, which decides whether they are fatal.
    pub async fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        loop {
            let socket = self.socket.as_mut()?;
            let message = match socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "gateway: read failed");
                    self.drop_socket();
                    return None;
                }
                None => {
                    tracing::info!("gateway: stream ended");
                    self.drop_socket();
                    return None;
                }
            };

            let decoded = match message {
                Message::Text(text) => Frame::decode(text.as_str()),
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => Frame::decode(text),
                    Err(_) => Err(FrameError::NotText),
                },
                Message::Close(frame) => {
                    tracing::info!(close = ?frame, "gateway: close frame received");
                    self.drop_socket();
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            self.frames_in += 1;
            if let Err(err) = &decoded {
                tracing::warn!(error = %err, "gateway: undecodable frame");
            }
            return Some(decoded);
        }
    }

    /// Closes the socket. Safe to call any number of times.
    pub async fn close(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            self.state = ConnectionState::Closed;
            return;
        };
        self.state = ConnectionState::Closed;

        tracing::info!(
            url = %self.url,
            age_ms = self.opened_at.elapsed().as_millis() as u64,
            frames_in = self.frames_in,
            frames_out = self.frames_out,
            "closing gateway connection"
        );
        match tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(error = %err, "gateway: close handshake failed"),
            Err(_) => tracing::debug!("gateway: close handshake timed out"),
        }
    }

    fn drop_socket(&mut self) {
        self.socket = None;
        self.state = ConnectionState::Closed;
    }
}
