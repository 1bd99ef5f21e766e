//! Offer/answer negotiation between two real `webrtc` peer connections

use anyhow::{bail, Result};
use peerchat::webrtc::{
    decode_description, EndpointId, EndpointOutput, EndpointState, EventSink,
    NegotiationEndpoint, Role, RtcTransportFactory, SignalMessage, TransportEvent,
    TransportFactory,
};
use std::time::Duration;
use tokio::sync::mpsc;

type Events = mpsc::UnboundedReceiver<(EndpointId, TransportEvent)>;

async fn endpoint_with_events(
    factory: &RtcTransportFactory,
    id: u32,
    role: Role,
) -> Result<(NegotiationEndpoint, EventSink, Events)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = EventSink::new(EndpointId(id), tx);
    let transport = factory.create(sink.clone()).await?;
    let endpoint = NegotiationEndpoint::new(role, transport, sink.clone(), "chat");
    Ok((endpoint, sink, rx))
}

async fn endpoint(
    factory: &RtcTransportFactory,
    id: u32,
    role: Role,
) -> Result<(NegotiationEndpoint, EventSink)> {
    // Callbacks are not drained here; only the negotiation path is exercised
    let (endpoint, sink, _) = endpoint_with_events(factory, id, role).await?;
    Ok((endpoint, sink))
}

#[tokio::test]
async fn test_local_and_remote_endpoints_negotiate() -> Result<()> {
    // No STUN servers: host candidates only, no network access needed
    let factory = RtcTransportFactory::new(Vec::new());
    let (mut local, _) = endpoint(&factory, 0, Role::Local).await?;
    let (mut remote, _) = endpoint(&factory, 1, Role::Remote).await?;

    let offer = local.initiate_as_local().await?;
    assert_eq!(local.state(), EndpointState::Negotiating);
    assert!(local.has_data_channel());
    let desc = decode_description(&offer)?;
    assert!(desc.sdp.contains("m=application"));

    let answer = remote.initiate_as_remote(&offer).await?;
    assert_eq!(remote.state(), EndpointState::Negotiating);
    assert!(decode_description(&answer)?.sdp.starts_with("v=0"));

    local.apply_answer(&answer).await?;
    assert_eq!(local.state(), EndpointState::Negotiating);

    local.close().await;
    remote.close().await;
    assert_eq!(local.state(), EndpointState::Closed);
    assert_eq!(remote.state(), EndpointState::Closed);

    Ok(())
}

#[tokio::test]
async fn test_closed_endpoint_detaches_its_sink() -> Result<()> {
    let factory = RtcTransportFactory::new(Vec::new());
    let (mut local, sink) = endpoint(&factory, 0, Role::Local).await?;

    local.initiate_as_local().await?;
    local.close().await;

    assert!(sink.is_detached());
    assert!(local.send("hello").await.is_err());
    // Closing twice releases nothing twice
    local.close().await;
    assert_eq!(local.state(), EndpointState::Closed);

    Ok(())
}

#[tokio::test]
async fn test_answer_rejected_as_offer() -> Result<()> {
    let factory = RtcTransportFactory::new(Vec::new());
    let (mut local, _) = endpoint(&factory, 0, Role::Local).await?;
    let (mut remote, _) = endpoint(&factory, 1, Role::Remote).await?;
    let (mut other, _) = endpoint(&factory, 2, Role::Remote).await?;

    let offer = local.initiate_as_local().await?;
    let answer = remote.initiate_as_remote(&offer).await?;

    // An answer relayed where an offer was expected fails only that endpoint
    assert!(other.initiate_as_remote(&answer).await.is_err());
    assert_eq!(other.state(), EndpointState::Closed);
    assert_eq!(remote.state(), EndpointState::Negotiating);

    local.close().await;
    remote.close().await;
    Ok(())
}

#[tokio::test]
async fn test_endpoints_connect_and_exchange_text() -> Result<()> {
    let factory = RtcTransportFactory::new(Vec::new());
    let (mut local, _, mut local_events) = endpoint_with_events(&factory, 0, Role::Local).await?;
    let (mut remote, _, mut remote_events) =
        endpoint_with_events(&factory, 1, Role::Remote).await?;

    let offer = local.initiate_as_local().await?;
    let answer = remote.initiate_as_remote(&offer).await?;
    local.apply_answer(&answer).await?;

    // Stand in for the relay: candidates cross over, the local side sends once open
    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    let mut sent = false;
    let mut received = None;

    while received.is_none()
        || local.state() != EndpointState::Connected
        || remote.state() != EndpointState::Connected
    {
        tokio::select! {
            _ = &mut deadline => bail!(
                "no connection: local={} remote={} sent={} received={:?}",
                local.state(), remote.state(), sent, received
            ),
            Some((_, event)) = local_events.recv() => {
                let opened = matches!(event, TransportEvent::ChannelOpen);
                if let Some(EndpointOutput::Relay(SignalMessage::IceCandidate(c))) =
                    local.handle_transport_event(event)
                {
                    remote.apply_ice_candidate(&c).await?;
                }
                if opened && !sent {
                    local.send("hello").await?;
                    sent = true;
                }
            }
            Some((_, event)) = remote_events.recv() => match remote.handle_transport_event(event) {
                Some(EndpointOutput::Relay(SignalMessage::IceCandidate(c))) => {
                    local.apply_ice_candidate(&c).await?;
                }
                Some(EndpointOutput::Received(text)) => received = Some(text),
                _ => {}
            },
        }
    }

    assert!(sent);
    assert_eq!(received.as_deref(), Some("hello"));
    assert!(remote.has_data_channel());

    local.close().await;
    remote.close().await;
    Ok(())
}
