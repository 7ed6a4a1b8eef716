use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{net::TcpListener, task::JoinHandle, time::timeout};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::hub::{ChannelId, Hub, Mailbox, Payload};

/// Body served on `GET /` once the relay is accepting connections.
pub const READINESS_BANNER: &str = "Boardgame backend running!";

/// How long a closing channel may spend flushing payloads queued before its
/// deregistration.
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Relay {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Relay {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_hub(listener, Arc::new(Hub::new()))
    }

    pub fn with_hub(listener: TcpListener, hub: Arc<Hub>) -> Self {
        Self { listener, hub }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Relay { listener, hub } = self;

        let shutdown_hub = Arc::clone(&hub);
        let signal = async move {
            shutdown.await;
            handle_shutdown(&shutdown_hub).await;
        };

        axum::serve(
            listener,
            router(hub).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .context("relay server failed")?;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(hub: &Hub) {
    let closed = hub.close_all().await;
    info!(closed, "relay shutting down");
}

fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/", get(readiness))
        .route("/ws", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn readiness() -> &'static str {
    READINESS_BANNER
}

async fn upgrade(
    State(hub): State<Arc<Hub>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, hub, peer))
}

async fn handle_connection(socket: WebSocket, hub: Arc<Hub>, peer: SocketAddr) {
    let (channel, mailbox) = hub.open_channel();
    let channel_id = channel.id();
    let (writer, mut reader) = socket.split();

    hub.register(channel).await;
    info!(%peer, channel_id, "channel opened");

    let mut forwarder = spawn_forwarder(channel_id, mailbox, writer);

    while let Some(frame) = reader.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => Payload::Text(text),
            Ok(Message::Binary(bytes)) => Payload::Binary(bytes),
            // Keep polling so the close reply gets flushed; the stream ends
            // once the handshake completes.
            Ok(Message::Close(_)) => continue,
            // Answered by the websocket layer itself.
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(err) => {
                warn!(%peer, channel_id, error = %err, "channel read failed");
                break;
            }
        };

        let bytes = payload.len();
        let report = hub.broadcast(channel_id, payload).await;
        debug!(
            channel_id,
            bytes,
            delivered = report.delivered,
            dropped = report.dropped,
            "relayed payload"
        );
    }

    // Without the hub's handle the mailbox ends after the queued payloads.
    hub.deregister(channel_id).await;
    if timeout(FORWARDER_DRAIN_TIMEOUT, &mut forwarder).await.is_err() {
        debug!(channel_id, "forwarder still busy after close, aborting");
        forwarder.abort();
    }
    info!(%peer, channel_id, "channel closed");
}

/// Drains the channel's mailbox into the socket. Once the hub drops the
/// channel (shutdown) the mailbox ends and the socket gets a close frame.
fn spawn_forwarder(
    channel_id: ChannelId,
    mut mailbox: Mailbox,
    mut writer: SplitSink<WebSocket, Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = mailbox.recv().await {
            if let Err(err) = writer.send(into_message(payload)).await {
                debug!(channel_id, error = %err, "failed to deliver payload");
                return;
            }
        }
        let _ = writer.send(Message::Close(None)).await;
    })
}

fn into_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::Text(text),
        Payload::Binary(bytes) => Message::Binary(bytes),
    }
}
