//! Collaborator traits the control engine depends on

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::error::Result;
use crate::protocol::acmp::AcmpStatus;
use crate::protocol::aecp::AecpStatus;
use crate::protocol::aem::COUNTER_COUNT;
use crate::types::{EntityId, MacAddress, StreamId};

/// Raw Ethernet frame exchanged with the transport adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical port the frame was received or sent on
    pub port: u16,
    /// Source MAC
    pub source: MacAddress,
    /// Destination MAC
    pub destination: MacAddress,
    /// EtherType
    pub ethertype: u16,
    /// Bytes following the Ethernet header
    pub payload: Bytes,
}

/// Sends raw frames on a logical network port.
///
/// Sending must not block. Inbound frames are delivered to the stack
/// separately, through the runner's frame channel.
pub trait Transport: Send + Sync {
    /// Queue one frame for transmission
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::Transport` if the frame cannot be queued.
    fn send_frame(
        &self,
        port: u16,
        destination: MacAddress,
        ethertype: u16,
        payload: Bytes,
    ) -> Result<()>;

    /// MAC address of the interface behind `port`
    fn local_mac(&self, port: u16) -> MacAddress;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_frame(
        &self,
        port: u16,
        destination: MacAddress,
        ethertype: u16,
        payload: Bytes,
    ) -> Result<()> {
        (**self).send_frame(port, destination, ethertype, payload)
    }

    fn local_mac(&self, port: u16) -> MacAddress {
        (**self).local_mac(port)
    }
}

/// Direction of a local stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    /// STREAM_INPUT, the listener side
    Input,
    /// STREAM_OUTPUT, the talker side
    Output,
}

/// Identifies one local stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    /// Input or output
    pub direction: StreamDirection,
    /// Descriptor index, equal to the ACMP unique id
    pub index: u16,
}

impl StreamHandle {
    /// Talker stream `index`
    #[must_use]
    pub fn output(index: u16) -> Self {
        Self {
            direction: StreamDirection::Output,
            index,
        }
    }

    /// Listener stream `index`
    #[must_use]
    pub fn input(index: u16) -> Self {
        Self {
            direction: StreamDirection::Input,
            index,
        }
    }
}

/// Parameters handed to the data plane for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    /// Local stream
    pub handle: StreamHandle,
    /// Stream id, zero when not connected yet
    pub stream_id: StreamId,
    /// Destination MAC of the stream
    pub dest_mac: MacAddress,
    /// VLAN of the stream
    pub vlan_id: u16,
    /// Stream format
    pub format: u64,
    /// SR class B instead of class A
    pub class_b: bool,
    /// Remote peer: the talker for inputs, zero for outputs
    pub peer: EntityId,
}

/// Media data plane and bandwidth reservation.
///
/// Only `start_stream` and `stop_stream` are mandatory; the reservation
/// hooks default to always succeeding.
pub trait StreamingBackend: Send {
    /// Start frame transmission or reception
    ///
    /// # Errors
    ///
    /// Returns the AECP status to answer START_STREAMING with.
    fn start_stream(&mut self, params: &StreamParams) -> std::result::Result<(), AecpStatus>;

    /// Stop frame transmission or reception
    ///
    /// # Errors
    ///
    /// Returns the AECP status to answer STOP_STREAMING with.
    fn stop_stream(&mut self, handle: StreamHandle) -> std::result::Result<(), AecpStatus>;

    /// Reserve bandwidth before a talker accepts its first listener
    ///
    /// # Errors
    ///
    /// Returns the ACMP status the CONNECT_TX response carries.
    fn reserve_talker(&mut self, _params: &StreamParams) -> std::result::Result<(), AcmpStatus> {
        Ok(())
    }

    /// Release the reservation after the last listener left
    fn release_talker(&mut self, _handle: StreamHandle) {}

    /// Attach a listener stream to the talker's stream
    ///
    /// # Errors
    ///
    /// Returns the ACMP status describing why binding failed.
    fn bind_listener(&mut self, _params: &StreamParams) -> std::result::Result<(), AcmpStatus> {
        Ok(())
    }

    /// Detach a listener stream
    fn unbind_listener(&mut self, _handle: StreamHandle) {}

    /// Per-stream counters as `(valid bitmap, values)`
    fn stream_counters(&self, _handle: StreamHandle) -> Option<(u32, [u32; COUNTER_COUNT])> {
        None
    }
}

/// Data plane that accepts everything and does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStreaming;

impl StreamingBackend for NullStreaming {
    fn start_stream(&mut self, _params: &StreamParams) -> std::result::Result<(), AecpStatus> {
        Ok(())
    }

    fn stop_stream(&mut self, _handle: StreamHandle) -> std::result::Result<(), AecpStatus> {
        Ok(())
    }
}

/// Grandmaster information reported by gPTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GptpInfo {
    /// Clock identity of the grandmaster
    pub grandmaster_id: u64,
    /// gPTP domain
    pub domain_number: u8,
}

/// Read-only view of the gPTP state
pub trait GptpSource: Send {
    /// Current grandmaster
    fn current(&self) -> GptpInfo;
}

/// Fixed grandmaster, for tests and for networks without gPTP
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticGptp(pub GptpInfo);

impl GptpSource for StaticGptp {
    fn current(&self) -> GptpInfo {
        self.0
    }
}

impl GptpSource for watch::Receiver<GptpInfo> {
    fn current(&self) -> GptpInfo {
        *self.borrow()
    }
}
