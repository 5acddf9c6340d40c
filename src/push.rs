//! Push variant of the notification channel.
//!
//! One persistent connection to a URL fixed at startup. Text frames are
//! decoded and delivered in arrival order. Whenever the connection ends
//! without the client asking for it, or fails to open, the loop waits
//! `reconnect_delay` and makes exactly one new attempt, indefinitely.
//! Shutdown closes the connection with code 1001 ("going away").

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::GatewayError;
use crate::notification::{
    ChannelHandle, ChannelMode, NotificationCallback, NotificationConfig, StatusCell,
    parse_notification,
};

/// Default push endpoint of the deployed backend.
pub const DEFAULT_PUSH_URL: &str = "ws://localhost:4004/ws/payment-notifications";

/// Close code sent when the owning view goes away.
pub const GOING_AWAY: u16 = 1001;

/// Upper bound on the closing handshake during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A frame read from a push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    /// A text frame; expected to hold one JSON notification.
    Text(String),
    /// The peer closed the connection.
    Closed {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// Binary, ping or pong; ignored.
    Other,
}

/// An open push connection.
#[async_trait::async_trait]
pub trait PushConnection: Send {
    /// Read the next frame.
    ///
    /// # Returns
    ///
    /// `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<PushFrame, GatewayError>>;

    /// Start the closing handshake with `code` and `reason`.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), GatewayError>;
}

/// Opens push connections.
#[async_trait::async_trait]
pub trait PushConnector: Send + Sync + 'static {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the connection could not be
    /// established.
    async fn connect(&self, url: &str) -> Result<Box<dyn PushConnection>, GatewayError>;
}

/// [`PushConnector`] over WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait::async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushConnection>, GatewayError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| GatewayError::Transport(format!("websocket connect: {e}")))?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait::async_trait]
impl PushConnection for WsConnection {
    async fn next_frame(&mut self) -> Option<Result<PushFrame, GatewayError>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(GatewayError::Transport(format!("websocket read: {e}")))),
        };
        Some(Ok(frame_from_message(message)))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), GatewayError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_owned()),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| GatewayError::Transport(format!("websocket close: {e}")))
    }
}

fn frame_from_message(message: Message) -> PushFrame {
    match message {
        Message::Text(text) => PushFrame::Text(text),
        Message::Close(frame) => PushFrame::Closed {
            code: frame.as_ref().map(|f| u16::from(f.code)),
            reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
        },
        _ => PushFrame::Other,
    }
}

/// Start the push channel.
///
/// # Arguments
///
/// * `connector` - Opens connections; [`WsConnector`] in production.
/// * `url` - Endpoint, fixed for the lifetime of the channel.
/// * `config` - Only `reconnect_delay` is used.
/// * `callback` - Receives each delivered notification.
///
/// # Returns
///
/// A [`ChannelHandle`] whose `shutdown` closes the connection with
/// [`GOING_AWAY`] and cancels any pending reconnect.
pub fn start_push(
    connector: Arc<dyn PushConnector>,
    url: impl Into<String>,
    config: &NotificationConfig,
    callback: NotificationCallback,
) -> ChannelHandle {
    let url = url.into();
    let reconnect_delay = config.reconnect_delay;
    ChannelHandle::spawn(ChannelMode::Push, move |shutdown_rx, status| {
        run_push_loop(connector, url, reconnect_delay, callback, status, shutdown_rx)
    })
}

/// Why a connection stopped delivering frames.
enum Disconnect {
    /// The client is shutting down.
    Shutdown,
    /// Anything else: peer close, read error, end of stream.
    Lost(String),
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shutdown"),
            Self::Lost(reason) => f.write_str(reason),
        }
    }
}

/// Core loop spawned by [`start_push`].
async fn run_push_loop(
    connector: Arc<dyn PushConnector>,
    url: String,
    reconnect_delay: Duration,
    callback: NotificationCallback,
    status: StatusCell,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        tracing::debug!(url = %url, "push: connecting");
        let connected = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            result = connector.connect(&url) => result,
        };

        match connected {
            Ok(mut connection) => {
                status.set_connected();
                tracing::info!(url = %url, "push: connected");

                match pump(connection.as_mut(), &callback, &mut shutdown_rx).await {
                    Disconnect::Shutdown => {
                        close_going_away(connection.as_mut()).await;
                        status.set_disconnected(None);
                        return;
                    }
                    lost @ Disconnect::Lost(_) => {
                        tracing::warn!(
                            reason = %lost,
                            delay_ms = reconnect_delay.as_millis() as u64,
                            "push: connection lost, will reconnect"
                        );
                        status.set_disconnected(Some(lost.to_string()));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    delay_ms = reconnect_delay.as_millis() as u64,
                    "push: connect failed, will retry"
                );
                status.set_disconnected(Some(e.user_message()));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Deliver frames from `connection` until it ends or shutdown is signalled.
async fn pump(
    connection: &mut dyn PushConnection,
    callback: &NotificationCallback,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Disconnect {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return Disconnect::Shutdown,
            frame = connection.next_frame() => frame,
        };

        match frame {
            Some(Ok(PushFrame::Text(text))) => match parse_notification(&text) {
                Ok(notification) => {
                    tracing::info!(status = %notification.status, "push: payment notification received");
                    callback(notification);
                }
                Err(e) => tracing::warn!(error = %e, "push: dropping malformed frame"),
            },
            Some(Ok(PushFrame::Other)) => {}
            Some(Ok(PushFrame::Closed { code, reason })) => {
                let code = code.map_or_else(|| "none".to_owned(), |c| c.to_string());
                return Disconnect::Lost(format!("closed by server (code {code}) {reason}"));
            }
            Some(Err(e)) => return Disconnect::Lost(e.to_string()),
            None => return Disconnect::Lost("stream ended".to_owned()),
        }
    }
}

async fn close_going_away(connection: &mut dyn PushConnection) {
    match tokio::time::timeout(CLOSE_TIMEOUT, connection.close(GOING_AWAY, "going away")).await {
        Ok(Ok(())) => tracing::debug!("push: closed"),
        Ok(Err(e)) => tracing::debug!(error = %e, "push: close failed"),
        Err(_) => tracing::debug!("push: close timed out"),
    }
}
