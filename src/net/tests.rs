use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use super::*;
use crate::error::AvdeccError;
use crate::protocol::AVTP_ETHERTYPE;
use crate::types::MacAddress;

const MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 1]);

#[test]
fn test_channel_transport_fills_source() {
    let (transport, mut rx) = ChannelTransport::new(MAC, 4);
    transport
        .send_frame(
            3,
            MacAddress::AVDECC_MULTICAST,
            AVTP_ETHERTYPE,
            Bytes::from_static(&[1, 2]),
        )
        .unwrap();

    let frame = rx.try_recv().unwrap();
    assert_eq!(frame.port, 3);
    assert_eq!(frame.source, MAC);
    assert_eq!(frame.destination, MacAddress::AVDECC_MULTICAST);
    assert_eq!(frame.payload.as_ref(), &[1, 2]);
    assert_eq!(transport.local_mac(0), MAC);
}

#[test]
fn test_channel_transport_full_queue() {
    let (transport, _rx) = ChannelTransport::new(MAC, 1);
    let send = || transport.send_frame(0, MacAddress::BROADCAST, AVTP_ETHERTYPE, Bytes::new());

    send().unwrap();
    let err = send().unwrap_err();
    assert!(matches!(err, AvdeccError::Transport { port: 0, .. }));
}

#[test]
fn test_channel_transport_closed() {
    let (transport, rx) = ChannelTransport::new(MAC, 1);
    drop(rx);
    let shared: Arc<dyn Transport> = Arc::new(transport);
    assert!(
        shared
            .send_frame(0, MacAddress::BROADCAST, AVTP_ETHERTYPE, Bytes::new())
            .is_err()
    );
}

#[test]
fn test_gptp_sources() {
    let info = GptpInfo {
        grandmaster_id: 0xAA,
        domain_number: 1,
    };
    assert_eq!(StaticGptp(info).current(), info);

    let (tx, rx) = watch::channel(GptpInfo::default());
    assert_eq!(rx.current(), GptpInfo::default());
    tx.send(info).unwrap();
    assert_eq!(rx.current(), info);
}

#[test]
fn test_null_streaming_accepts() {
    let mut backend = NullStreaming;
    let params = StreamParams {
        handle: StreamHandle::output(0),
        stream_id: crate::types::StreamId(1),
        dest_mac: MacAddress::STREAM_POOL_BASE,
        vlan_id: 2,
        format: 0,
        class_b: false,
        peer: crate::types::EntityId::NONE,
    };
    assert!(backend.start_stream(&params).is_ok());
    assert!(backend.reserve_talker(&params).is_ok());
    assert!(backend.bind_listener(&params).is_ok());
    assert!(backend.stream_counters(StreamHandle::input(0)).is_none());
    assert!(backend.stop_stream(StreamHandle::output(0)).is_ok());
}
