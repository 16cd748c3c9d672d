//! Links to the coordination server.
//!
//! A [`Link`] is one live connection expressed as a pair of text-frame
//! queues. The channel never sees sockets; a [`Connector`] produces links and
//! the link closing (inbound queue ends) is what signals a disconnect.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::error::SignalingError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The client half of a live connection.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// The far half of a [`Link`]: whatever pumps frames to and from the server.
#[derive(Debug)]
pub struct LinkEnd {
    /// Frames the client wants sent. Ends when the client drops the link.
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Frames delivered to the client. Dropping this closes the link.
    pub to_client: mpsc::UnboundedSender<String>,
}

impl Link {
    pub fn channel() -> (Link, LinkEnd) {
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        (
            Link { outbound, inbound },
            LinkEnd {
                from_client,
                to_client,
            },
        )
    }
}

/// Opens links to the coordination server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link, SignalingError>;
}

/// WebSocket connector with ping keepalive.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    heartbeat_interval: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_secs(25),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link, SignalingError> {
        let (ws, _) = connect_async(self.url.as_str()).await?;
        tracing::debug!(url = %self.url, "Signaling: websocket open");

        let (link, end) = Link::channel();
        tokio::spawn(pump(ws, end, self.heartbeat_interval));
        Ok(link)
    }
}

/// Shovel frames between the socket and the link until either side closes.
async fn pump(ws: WsStream, end: LinkEnd, heartbeat_interval: Duration) {
    if let Err(e) = run_pump(ws, end, heartbeat_interval).await {
        tracing::warn!(error = %e, "Signaling: websocket closed with error");
    }
}

async fn run_pump(
    ws: WsStream,
    end: LinkEnd,
    heartbeat_interval: Duration,
) -> Result<(), SignalingError> {
    let (mut sink, mut stream) = ws.split();
    let LinkEnd {
        mut from_client,
        to_client,
    } = end;

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = from_client.recv() => match frame {
                Some(text) => sink.send(Message::Text(text.into())).await?,
                None => return flush_and_close(&mut sink, &mut from_client).await,
            },
            msg = stream.next() => {
                let Some(msg) = msg else { return Ok(()) };
                match msg? {
                    Message::Text(t) => {
                        if to_client.send(t.as_str().to_owned()).is_err() {
                            // Client stopped reading; it may still have frames queued.
                            return flush_and_close(&mut sink, &mut from_client).await;
                        }
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                sink.send(Message::Ping(Default::default())).await?;
            }
        }
    }
}

/// Send whatever the client queued, then close. Returns once the client has
/// dropped its sender.
async fn flush_and_close(
    sink: &mut SplitSink<WsStream, Message>,
    from_client: &mut mpsc::UnboundedReceiver<String>,
) -> Result<(), SignalingError> {
    while let Some(text) = from_client.recv().await {
        sink.send(Message::Text(text.into())).await?;
    }
    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}
