//! Transport adapter
//!
//! The engine never touches sockets. It asks a [`Transport`] to open a
//! connection, gets back a [`Connection`] to push text frames into, and
//! receives [`TransportEvent`]s on a channel. [`WsTransport`] is the
//! WebSocket implementation used outside of tests.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::ocpp::OcppError;

/// Notifications from the transport to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Text(String),
    Closed,
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Opens connections. `connect` must return without waiting on the network.
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        url: &str,
        subprotocol: &str,
        events: EventSender,
    ) -> Result<Box<dyn Connection>, OcppError>;
}

/// An open (or opening) connection. Frames sent before the socket is up are
/// delivered in order once it opens.
pub trait Connection: Send {
    fn send(&self, frame: String) -> Result<(), OcppError>;
    fn close(&self);
}

enum Outgoing {
    Frame(String),
    Close,
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsTransport {
    pub max_message_size: usize,
    pub max_frame_size: usize,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

impl Transport for WsTransport {
    fn connect(
        &self,
        url: &str,
        subprotocol: &str,
        events: EventSender,
    ) -> Result<Box<dyn Connection>, OcppError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| OcppError::TransportFailure(format!("invalid URL {url}: {e}")))?;
        let protocol = HeaderValue::from_str(subprotocol)
            .map_err(|e| OcppError::TransportFailure(format!("invalid subprotocol: {e}")))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.max_message_size),
            max_frame_size: Some(self.max_frame_size),
            ..Default::default()
        };

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(
            request,
            ws_config,
            subprotocol.to_string(),
            outgoing_rx,
            events,
        ));

        Ok(Box::new(WsConnection { outgoing_tx }))
    }
}

struct WsConnection {
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
}

impl Connection for WsConnection {
    fn send(&self, frame: String) -> Result<(), OcppError> {
        self.outgoing_tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| OcppError::TransportFailure("connection task has stopped".into()))
    }

    fn close(&self) {
        let _ = self.outgoing_tx.send(Outgoing::Close);
    }
}

/// Connect, then shuttle frames both ways until either side closes
async fn run_socket(
    request: Request,
    ws_config: WebSocketConfig,
    subprotocol: String,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
    events: EventSender,
) {
    let uri = request.uri().to_string();

    let (ws_stream, response) =
        match connect_async_with_config(request, Some(ws_config), false).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("WebSocket connection to {} failed: {}", uri, e);
                let _ = events.send(TransportEvent::Error(e.to_string()));
                return;
            }
        };

    // Verify subprotocol
    let accepted_protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted_protocol != Some(subprotocol.as_str()) {
        warn!(
            "CSMS did not accept subprotocol {}, got: {:?}",
            subprotocol, accepted_protocol
        );
    }

    info!("WebSocket connected to {}", uri);
    if events.send(TransportEvent::Opened).is_err() {
        return;
    }

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => match outgoing {
                Some(Outgoing::Frame(text)) => {
                    debug!("Sending: {}", text);
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        error!("Failed to send WebSocket message: {}", e);
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    let _ = events.send(TransportEvent::Closed);
                    return;
                }
            },

            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!("Received: {}", text);
                    let _ = events.send(TransportEvent::Text(text.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket closed by server");
                    let _ = events.send(TransportEvent::Closed);
                    return;
                }
                Some(Ok(_)) => {
                    // Binary, ping and pong frames carry nothing for OCPP-J
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    return;
                }
            },
        }
    }
}
