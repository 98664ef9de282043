#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rover_signal::{
    hub::RelayHub,
    server::{RelayServer, RelaySettings},
};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(200);

pub async fn start_relay(settings: RelaySettings) -> (String, RelayHub) {
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), settings)
        .await
        .unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let hub = server.hub();
    tokio::spawn(server.run());
    (url, hub)
}

pub async fn connect(url: &str) -> Client {
    connect_async(url).await.unwrap().0
}

pub async fn send(ws: &mut Client, text: &str) {
    ws.send(Message::text(text.to_owned())).await.unwrap();
}

/// Connect and join `room`, returning once the hub has registered the member.
pub async fn join(url: &str, hub: &RelayHub, room: &str) -> Client {
    let mut ws = connect(url).await;
    let before = hub.room_size(room);
    send(&mut ws, &format!(r#"{{"type":"join","room":"{room}"}}"#)).await;
    wait_until(|| hub.room_size(room) > before).await;
    ws
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next text frame, skipping keep-alive traffic.
pub async fn recv_text(ws: &mut Client) -> String {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("no frame in time")
            .expect("connection closed")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return text.as_str().to_owned(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

pub async fn assert_silent(ws: &mut Client) {
    if let Ok(frame) = timeout(QUIET, ws.next()).await {
        panic!("expected no traffic, got {frame:?}");
    }
}
