mod common;

use std::time::Duration;

use futures_util::StreamExt;
use rover_signal::server::RelaySettings;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{protocol::frame::coding::CloseCode, Message};

use common::{assert_silent, connect, join, recv_text, send, start_relay, wait_until, WAIT};

const OFFER_A: &str = r#"{"type":"offer","sdp":"sdpA","sdpType":"offer"}"#;
const ANSWER_B: &str = r#"{"type":"answer","sdp":"sdpB","sdpType":"answer"}"#;

#[tokio::test]
async fn offer_and_answer_reach_only_the_other_member() {
    let (url, hub) = start_relay(RelaySettings::default()).await;
    let mut b = join(&url, &hub, "r1").await;
    let mut a = join(&url, &hub, "r1").await;

    send(&mut a, OFFER_A).await;
    assert_eq!(recv_text(&mut b).await, OFFER_A);
    assert_silent(&mut b).await;
    assert_silent(&mut a).await;

    send(&mut b, ANSWER_B).await;
    assert_eq!(recv_text(&mut a).await, ANSWER_B);
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn rooms_are_isolated() {
    let (url, hub) = start_relay(RelaySettings::default()).await;
    let mut a = join(&url, &hub, "r1").await;
    let mut b = join(&url, &hub, "r2").await;

    send(&mut a, OFFER_A).await;
    send(&mut b, ANSWER_B).await;

    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
    assert_eq!(hub.room_count(), 2);
}

#[tokio::test]
async fn non_join_first_message_closes_with_protocol_error() {
    let (url, hub) = start_relay(RelaySettings::default()).await;
    let mut ws = connect(&url).await;

    send(&mut ws, OFFER_A).await;

    let frame = timeout(WAIT, ws.next())
        .await
        .expect("no close frame in time")
        .expect("stream ended without close frame")
        .expect("websocket error");
    let Message::Close(Some(close)) = frame else {
        panic!("expected a close frame, got {frame:?}");
    };
    assert_eq!(close.code, CloseCode::Protocol);
    assert_eq!(hub.room_count(), 0);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing() {
    let (url, hub) = start_relay(RelaySettings::default()).await;
    let mut a = join(&url, &hub, "r1").await;
    let mut b = join(&url, &hub, "r1").await;

    send(&mut a, "this is not json").await;
    send(&mut a, r#"{"no":"type"}"#).await;
    let candidate =
        r#"{"type":"candidate","candidate":"candidate:1 1 udp 1 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
    send(&mut a, candidate).await;

    assert_eq!(recv_text(&mut b).await, candidate);
    assert_silent(&mut b).await;
    assert_eq!(hub.room_size("r1"), 2);
}

#[tokio::test]
async fn empty_room_is_deleted_and_recreated_fresh() {
    let (url, hub) = start_relay(RelaySettings::default()).await;
    let mut a = join(&url, &hub, "r1").await;
    let b = join(&url, &hub, "r1").await;

    drop(b);
    wait_until(|| hub.room_size("r1") == 1).await;

    a.close(None).await.unwrap();
    wait_until(|| !hub.contains_room("r1")).await;
    assert_eq!(hub.room_count(), 0);

    let _c = join(&url, &hub, "r1").await;
    assert_eq!(hub.room_size("r1"), 1);
}

#[tokio::test]
async fn frames_from_one_sender_keep_their_order() {
    let (url, hub) = start_relay(RelaySettings::default()).await;
    let mut a = join(&url, &hub, "r1").await;
    let mut b = join(&url, &hub, "r1").await;

    let frames: Vec<String> = (0..20)
        .map(|i| format!(r#"{{"type":"candidate","candidate":"c{i}","sdpMid":"0","sdpMLineIndex":0}}"#))
        .collect();
    for frame in &frames {
        send(&mut a, frame).await;
    }

    for frame in &frames {
        assert_eq!(&recv_text(&mut b).await, frame);
    }
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let settings = RelaySettings {
        idle_timeout: Duration::from_millis(300),
        ..RelaySettings::default()
    };
    let (url, hub) = start_relay(settings).await;
    let mut a = join(&url, &hub, "r1").await;

    let ended = timeout(WAIT, async {
        loop {
            match a.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "idle connection was not closed");
    wait_until(|| !hub.contains_room("r1")).await;
}

#[tokio::test]
async fn stalled_reader_is_dropped_after_send_timeout() {
    let settings = RelaySettings {
        send_timeout: Duration::from_millis(200),
        queue_depth: 4096,
        ..RelaySettings::default()
    };
    let (url, hub) = start_relay(settings).await;
    let mut a = join(&url, &hub, "r1").await;
    // Never read from this one, so its socket buffers fill up.
    let _stalled = join(&url, &hub, "r1").await;

    let bulk = format!(r#"{{"type":"bulk","data":"{}"}}"#, "x".repeat(64 * 1024));
    timeout(Duration::from_secs(10), async {
        while hub.room_size("r1") > 1 {
            send(&mut a, &bulk).await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("stalled reader was never dropped");

    // The sender is unaffected and keeps reaching new members.
    let mut c = join(&url, &hub, "r1").await;
    send(&mut a, OFFER_A).await;
    loop {
        let text = recv_text(&mut c).await;
        if text == OFFER_A {
            break;
        }
        assert_eq!(text, bulk);
    }
}
