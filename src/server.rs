//! Websocket front end of the relay hub
//!
//! One task per connection reads frames and feeds them to the [`RelayHub`];
//! a second task per connection owns the websocket sink and drains that
//! connection's outbound queue. A recipient that cannot keep up only stalls its
//! own writer, which gives up after `send_timeout` and ends the connection. A
//! recipient whose queue fills up is evicted by the hub, which ends it too.

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::hub::{Connection, RelayHub};

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Transport-level timing and buffering for relay connections.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// How often the server pings an idle client.
    pub ping_interval: Duration,
    /// A connection that sends nothing (not even a pong) for this long is closed.
    pub idle_timeout: Duration,
    /// Upper bound for writing one frame to a client.
    pub send_timeout: Duration,
    /// Frames queued per connection before it counts as stalled and is evicted.
    pub queue_depth: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(40),
            send_timeout: Duration::from_secs(10),
            queue_depth: 64,
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    hub: RelayHub,
    settings: RelaySettings,
}

impl RelayServer {
    pub async fn bind(addr: SocketAddr, settings: RelaySettings) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding signaling listener on {addr}"))?;
        Ok(Self {
            listener,
            hub: RelayHub::new(),
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the room table, for inspection.
    pub fn hub(&self) -> RelayHub {
        self.hub.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!("Signaling server listening on ws://{}", self.local_addr()?);

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept TCP connection: {}", e);
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let hub = self.hub.clone();
            let settings = self.settings.clone();
            tokio::spawn(async move {
                serve_connection(stream, remote, hub, settings).await;
            });
        }
    }
}

/// Bind and serve until the process is stopped.
pub async fn run(addr: SocketAddr, settings: RelaySettings) -> Result<()> {
    RelayServer::bind(addr, settings).await?.run().await
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    hub: RelayHub,
    settings: RelaySettings,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Websocket handshake with {} failed: {}", remote, e);
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let (tx, rx) = mpsc::channel(settings.queue_depth);
    let mut conn = hub.accept(tx);
    debug!("Connection({}) from {}", *conn.id(), remote);

    let Some(first) = next_text(&mut stream, settings.idle_timeout).await else {
        hub.disconnect(conn);
        return;
    };

    if let Err(e) = hub.handle_first_message(&mut conn, &first) {
        warn!("Connection({}) from {}: {}", *conn.id(), remote, e);
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Protocol,
            reason: "First message must be a room join".into(),
        }));
        let _ = timeout(settings.send_timeout, sink.send(close)).await;
        hub.disconnect(conn);
        return;
    }

    let mut writer = tokio::spawn(write_loop(sink, rx, settings.clone(), *conn.id()));

    loop {
        tokio::select! {
            text = next_text(&mut stream, settings.idle_timeout) => {
                let Some(text) = text else {
                    break;
                };
                relay(&hub, &conn, &text);
            }
            _ = &mut writer => {
                debug!("Connection({}) writer stopped", *conn.id());
                break;
            }
        }
    }

    // The room holds the only queue sender; leaving it lets the writer drain and close.
    hub.disconnect(conn);
}

fn relay(hub: &RelayHub, conn: &Connection, text: &str) {
    match hub.broadcast(conn, text) {
        Ok(fan_out) if fan_out.failed > 0 => {
            debug!(
                "Connection({}) frame reached {} of {} peers",
                *conn.id(),
                fan_out.delivered,
                fan_out.delivered + fan_out.failed
            );
        }
        Ok(_) => {}
        Err(e) => debug!("Connection({}): {}", *conn.id(), e),
    }
}

/// Wait for the next text payload, skipping control frames. Returns `None`
/// when the peer closes, errors, or stays silent past `idle`.
async fn next_text(stream: &mut WsStream, idle: Duration) -> Option<String> {
    loop {
        let frame = match timeout(idle, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!("Websocket read failed: {}", e);
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                info!("Closing connection idle for {:?}", idle);
                return None;
            }
        };

        match frame {
            Message::Text(text) => return Some(text.as_str().to_owned()),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => return Some(text.to_owned()),
                Err(_) => debug!("Ignoring non UTF-8 binary frame ({} bytes)", data.len()),
            },
            Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<String>,
    settings: RelaySettings,
    id: u64,
) {
    let mut ping = interval(settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            next = rx.recv() => match next {
                Some(text) => Message::text(text),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Default::default()),
        };

        match timeout(settings.send_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Connection({}) write failed: {}", id, e);
                return;
            }
            Err(_) => {
                warn!(
                    "Connection({}) stalled for {:?}, disconnecting",
                    id, settings.send_timeout
                );
                return;
            }
        }
    }

    let _ = timeout(settings.send_timeout, sink.send(Message::Close(None))).await;
}
