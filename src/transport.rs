//! Realtime voice channel
//!
//! The transport carries discrete text and binary frames in both directions.
//! Inbound traffic and connection state changes are delivered as
//! [`TransportEvent`]s on the channel returned by [`Transport::open`].

use crate::error::{CallError, Result};
use crate::protocol::Frame;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Frame),
    /// Closed by the peer, with the close reason if one was given
    Closed(Option<String>),
    Error(String),
}

#[async_trait]
pub trait Transport: Send {
    /// Connect to `url`. Events for this connection arrive on the returned
    /// receiver until `Closed` or `Error`.
    async fn open(&mut self, url: &str) -> Result<UnboundedReceiver<TransportEvent>>;

    async fn send_text(&mut self, text: String) -> Result<()>;

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()>;

    /// Close the connection. Closing a transport that is not open is a no-op.
    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Default)]
pub struct WsTransport {
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn sink(&mut self) -> Result<&mut WsSink> {
        self.sink.as_mut().ok_or(CallError::TransportClosed)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&mut self, url: &str) -> Result<UnboundedReceiver<TransportEvent>> {
        if self.sink.is_some() {
            return Err(CallError::Transport("already connected".to_string()));
        }

        info!("🔌 Connecting to {}", url);
        let (ws_stream, response) = connect_async(url).await?;
        debug!("WebSocket handshake response: {:?}", response.status());

        let (sink, stream) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        self.sink = Some(sink);
        self.reader = Some(tokio::spawn(read_frames(stream, event_tx)));
        Ok(event_rx)
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        debug!("📤 {}", text);
        self.sink()?.send(Message::text(text)).await?;
        Ok(())
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink()?.send(Message::binary(data)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut sink) = self.sink.take() else {
            return Ok(());
        };
        info!("🔌 Closing voice channel");

        let result = sink.close().await;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.sink.is_some()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_frames(mut stream: WsSource, events: UnboundedSender<TransportEvent>) {
    debug!("Voice channel reader started");

    let last = loop {
        let Some(message) = stream.next().await else {
            break TransportEvent::Closed(None);
        };

        let event = match message {
            Ok(Message::Text(text)) => TransportEvent::Message(Frame::Text(text.to_string())),
            Ok(Message::Binary(bytes)) => {
                debug!("📥 Received {} bytes of audio", bytes.len());
                TransportEvent::Message(Frame::Binary(bytes.to_vec()))
            }
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty());
                info!("Server closed the voice channel: {:?}", reason);
                break TransportEvent::Closed(reason);
            }
            Ok(_) => continue,
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                break TransportEvent::Closed(None);
            }
            Err(e) => {
                error!("Voice channel error: {}", e);
                break TransportEvent::Error(e.to_string());
            }
        };

        if events.send(event).is_err() {
            warn!("Voice channel listener gone, stopping reader");
            return;
        }
    };

    let _ = events.send(last);
}
