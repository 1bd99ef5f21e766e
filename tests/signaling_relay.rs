//! Signaling channel against an in-process WebSocket relay

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use peerchat::webrtc::{ChannelEvent, ChannelState, SignalKind, SignalMessage, SignalingChannel};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

async fn next_event(channel: &mut SignalingChannel) -> Option<ChannelEvent> {
    tokio::time::timeout(Duration::from_secs(5), channel.next_event())
        .await
        .ok()
        .flatten()
}

fn text(json: &str) -> Message {
    Message::Text(json.to_string().into())
}

#[tokio::test]
async fn test_channel_exchanges_frames_with_relay() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut ws = accept_async(stream).await?;
        ws.send(text(r#"{"event":"init"}"#)).await?;
        ws.send(text("not a signaling frame")).await?;
        ws.send(text(r#"{"event":"sdp-answer","data":"x"}"#)).await?;
        ws.send(text(r#"{"event":"new-peer"}"#)).await?;

        let frame = loop {
            match ws.next().await {
                Some(Ok(Message::Text(t))) => break t.as_str().to_owned(),
                Some(Ok(_)) => continue,
                other => anyhow::bail!("relay expected a text frame, got {:?}", other),
            }
        };
        ws.close(None).await?;
        Ok::<_, anyhow::Error>(frame)
    });

    let mut channel = SignalingChannel::connect(&format!("ws://{}", addr));
    assert_eq!(channel.state(), ChannelState::Connecting);
    channel.on(SignalKind::Init)?;
    channel.on(SignalKind::NewPeer)?;

    assert_eq!(next_event(&mut channel).await, Some(ChannelEvent::Connected));
    assert_eq!(channel.state(), ChannelState::Open);

    // The garbage frame and the unsubscribed answer never surface
    assert_eq!(
        next_event(&mut channel).await,
        Some(ChannelEvent::Message(SignalMessage::Init))
    );
    assert_eq!(
        next_event(&mut channel).await,
        Some(ChannelEvent::Message(SignalMessage::NewPeer))
    );

    let offer = SignalMessage::SdpOffer(r#"{"type":"offer","sdp":"v=0"}"#.to_string());
    channel.send(offer.clone());

    let frame = relay.await??;
    assert!(frame.contains(r#""event":"sdp-offer""#));
    assert_eq!(SignalMessage::from_json(&frame)?, offer);

    assert_eq!(next_event(&mut channel).await, Some(ChannelEvent::Disconnected));
    assert_eq!(channel.state(), ChannelState::Closed);

    Ok(())
}

#[tokio::test]
async fn test_unreachable_relay_reports_connect_error() -> Result<()> {
    // Reserve a port, then free it so nothing is listening
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut channel = SignalingChannel::connect(&format!("ws://{}", addr));
    match next_event(&mut channel).await {
        Some(ChannelEvent::ConnectError(reason)) => assert!(!reason.is_empty()),
        other => panic!("Expected connect error, got {:?}", other),
    }
    assert_eq!(channel.state(), ChannelState::Closed);

    // Sending on a failed channel is a silent no-op
    channel.send(SignalMessage::Init);
    assert_eq!(next_event(&mut channel).await, None);

    Ok(())
}

#[tokio::test]
async fn test_disconnect_closes_socket_once() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut ws = accept_async(stream).await?;
        let mut frames = 0;
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_close() {
                break;
            }
            frames += 1;
        }
        Ok::<_, anyhow::Error>(frames)
    });

    let mut channel = SignalingChannel::connect(&format!("ws://{}", addr));
    assert_eq!(next_event(&mut channel).await, Some(ChannelEvent::Connected));

    channel.disconnect();
    channel.disconnect();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(channel.next_event().await, None);

    // The relay sees the socket close without any data frames
    let frames = tokio::time::timeout(Duration::from_secs(5), relay).await???;
    assert_eq!(frames, 0);

    Ok(())
}
