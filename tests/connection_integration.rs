use std::time::Duration;

use avdecc::protocol::acmp::{AcmpFlags, AcmpStatus};
use avdecc::testing::{
    StreamingFaults, VirtualNetwork, controller_config, listener_config, talker_config,
};
use avdecc::{AvdeccError, AvdeccEvent, ConnectionState, EntityId, StreamId};

mod common;
use common::{Node, init_tracing, spawn_node, wait_for_entity, wait_for_event};

struct Setup {
    talker: Node,
    listener: Node,
    second_listener: Node,
    controller: Node,
}

impl Setup {
    async fn new(network: &VirtualNetwork) -> Self {
        init_tracing();
        let setup = Self {
            talker: spawn_node(network, talker_config(1)),
            listener: spawn_node(network, listener_config(2)),
            second_listener: spawn_node(network, listener_config(4)),
            controller: spawn_node(network, controller_config(3)),
        };
        for node in [&setup.talker, &setup.listener, &setup.second_listener] {
            wait_for_entity(&setup.controller.handle, node.entity_id()).await;
        }
        setup
    }

    async fn teardown(self) {
        for node in [self.talker, self.listener, self.second_listener, self.controller] {
            node.handle.shutdown().await.unwrap();
        }
    }
}

fn acmp_status_of(result: Result<impl std::fmt::Debug, AvdeccError>) -> AcmpStatus {
    match result {
        Err(AvdeccError::AcmpStatus(status)) => status,
        other => panic!("expected an ACMP status error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_and_disconnect() {
    let network = VirtualNetwork::new();
    let s = Setup::new(&network).await;
    let talker = (s.talker.entity_id(), 0);
    let listener = (s.listener.entity_id(), 0);
    let mut events = s.controller.handle.subscribe();

    let connection = s
        .controller
        .handle
        .connect_stream(talker, listener)
        .await
        .unwrap();
    assert_eq!(connection.state, ConnectionState::Connected);
    assert_eq!(connection.talker_entity_id, talker.0);
    assert_eq!(connection.listener_entity_id, listener.0);
    assert_eq!(
        connection.stream_id,
        StreamId::from_mac(talker_config(1).mac_address, 0)
    );
    assert!(connection.stream_dest_mac.is_multicast());

    wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(
            e,
            AvdeccEvent::ConnectionChanged { connection }
                if connection.state == ConnectionState::Connected
        )
    })
    .await;
    let known = s.controller.handle.connections().await.unwrap();
    assert!(known.iter().any(|c| c.listener_entity_id == listener.0
        && c.state == ConnectionState::Connected));

    let rx = s.controller.handle.get_rx_state(listener).await.unwrap();
    assert_eq!(rx.state, ConnectionState::Connected);
    assert_eq!(rx.talker_entity_id, talker.0);

    let tx = s.controller.handle.get_tx_state(talker).await.unwrap();
    assert_eq!(tx.connection_count, 1);
    assert_eq!(
        s.controller.handle.get_tx_connection(talker, 0).await.unwrap(),
        listener
    );
    assert_eq!(
        acmp_status_of(s.controller.handle.get_tx_connection(talker, 1).await),
        AcmpStatus::NoSuchConnection
    );

    let talker_log = s.talker.streaming.log();
    assert_eq!(talker_log.reserved.len(), 1);
    let listener_log = s.listener.streaming.log();
    assert_eq!(listener_log.bound.len(), 1);
    assert_eq!(listener_log.bound[0].peer, talker.0);

    s.controller
        .handle
        .disconnect_stream(talker, listener)
        .await
        .unwrap();
    let rx = s.controller.handle.get_rx_state(listener).await.unwrap();
    assert_eq!(rx.state, ConnectionState::Disconnected);
    let tx = s.controller.handle.get_tx_state(talker).await.unwrap();
    assert_eq!(tx.connection_count, 0);
    assert_eq!(s.talker.streaming.log().released.len(), 1);
    assert_eq!(s.listener.streaming.log().unbound.len(), 1);

    assert_eq!(
        acmp_status_of(s.controller.handle.disconnect_stream(talker, listener).await),
        AcmpStatus::NotConnected
    );
    s.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_talker_listener_limit() {
    let network = VirtualNetwork::new();
    let s = Setup::new(&network).await;
    // Stream 1 accepts a single listener
    let talker = (s.talker.entity_id(), 1);

    s.controller
        .handle
        .connect_stream(talker, (s.listener.entity_id(), 0))
        .await
        .unwrap();
    assert_eq!(
        acmp_status_of(
            s.controller
                .handle
                .connect_stream(talker, (s.second_listener.entity_id(), 0))
                .await
        ),
        AcmpStatus::TalkerNoBandwidth
    );
    // The refused listener stays free for another talker stream
    s.controller
        .handle
        .connect_stream(
            (s.talker.entity_id(), 0),
            (s.second_listener.entity_id(), 0),
        )
        .await
        .unwrap();
    let tx = s.controller.handle.get_tx_state(talker).await.unwrap();
    assert_eq!(tx.connection_count, 1);
    s.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_listener_exclusive() {
    let network = VirtualNetwork::new();
    let s = Setup::new(&network).await;
    let listener = (s.listener.entity_id(), 0);

    s.controller
        .handle
        .connect_stream((s.talker.entity_id(), 0), listener)
        .await
        .unwrap();
    // Connecting the same pair again is answered from the listener's state
    s.controller
        .handle
        .connect_stream((s.talker.entity_id(), 0), listener)
        .await
        .unwrap();
    assert_eq!(
        acmp_status_of(
            s.controller
                .handle
                .connect_stream((s.talker.entity_id(), 1), listener)
                .await
        ),
        AcmpStatus::ListenerExclusive
    );
    s.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_requests() {
    let network = VirtualNetwork::new();
    let s = Setup::new(&network).await;
    let talker = (s.talker.entity_id(), 0);

    assert_eq!(
        acmp_status_of(
            s.controller
                .handle
                .connect_stream_with_flags(
                    talker,
                    (s.listener.entity_id(), 0),
                    AcmpFlags::CLASS_B
                )
                .await
        ),
        AcmpStatus::IncompatibleRequest
    );
    assert_eq!(
        acmp_status_of(
            s.controller
                .handle
                .connect_stream((s.talker.entity_id(), 7), (s.listener.entity_id(), 1))
                .await
        ),
        AcmpStatus::TalkerUnknownId
    );
    assert_eq!(
        acmp_status_of(
            s.controller
                .handle
                .connect_stream(talker, (s.listener.entity_id(), 9))
                .await
        ),
        AcmpStatus::ListenerUnknownId
    );

    s.talker.streaming.set_faults(StreamingFaults {
        reserve: Some(AcmpStatus::TalkerNoBandwidth),
        ..StreamingFaults::default()
    });
    assert_eq!(
        acmp_status_of(
            s.controller
                .handle
                .connect_stream(talker, (s.listener.entity_id(), 0))
                .await
        ),
        AcmpStatus::TalkerNoBandwidth
    );
    let rx = s
        .controller
        .handle
        .get_rx_state((s.listener.entity_id(), 0))
        .await
        .unwrap();
    assert_eq!(rx.state, ConnectionState::Disconnected);
    s.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_absent_talker() {
    let network = VirtualNetwork::new();
    let s = Setup::new(&network).await;
    let absent = EntityId(0x0011_22FF_FE33_4455);

    assert_eq!(
        acmp_status_of(
            s.controller
                .handle
                .connect_stream((absent, 0), (s.listener.entity_id(), 0))
                .await
        ),
        AcmpStatus::ListenerTalkerTimeout
    );
    // No listener answers for an absent entity either
    assert!(matches!(
        s.controller.handle.get_rx_state((absent, 0)).await,
        Err(AvdeccError::Timeout { .. })
    ));
    s.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_talker_departure_disconnects_listener() {
    let network = VirtualNetwork::new();
    let s = Setup::new(&network).await;
    let talker = (s.talker.entity_id(), 0);
    let listener = (s.listener.entity_id(), 0);
    wait_for_entity(&s.listener.handle, talker.0).await;

    s.controller
        .handle
        .connect_stream(talker, listener)
        .await
        .unwrap();
    let mut events = s.listener.handle.subscribe();
    s.talker.handle.shutdown().await.unwrap();

    wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(
            e,
            AvdeccEvent::ConnectionChanged { connection }
                if connection.state == ConnectionState::Disconnected
        )
    })
    .await;
    let rx = s.controller.handle.get_rx_state(listener).await.unwrap();
    assert_eq!(rx.state, ConnectionState::Disconnected);
    assert_eq!(s.listener.streaming.log().unbound.len(), 1);

    for node in [s.listener, s.second_listener, s.controller] {
        node.handle.shutdown().await.unwrap();
    }
}
