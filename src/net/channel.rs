//! Transport over a tokio channel

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use super::traits::{Frame, Transport};
use crate::error::{AvdeccError, Result};
use crate::types::MacAddress;

/// Transport that queues outgoing frames on a bounded channel.
///
/// The receiving end is typically drained by a task that writes to a raw
/// socket, or by a test.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    mac: MacAddress,
    tx: mpsc::Sender<Frame>,
}

impl ChannelTransport {
    /// Create a transport for interface `mac` and the receiver of its
    /// outgoing frames
    #[must_use]
    pub fn new(mac: MacAddress, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { mac, tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send_frame(
        &self,
        port: u16,
        destination: MacAddress,
        ethertype: u16,
        payload: Bytes,
    ) -> Result<()> {
        trace!(port, %destination, len = payload.len(), "queue frame");
        self.tx
            .try_send(Frame {
                port,
                source: self.mac,
                destination,
                ethertype,
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    AvdeccError::transport(port, "transmit queue full")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    AvdeccError::transport(port, "transmit queue closed")
                }
            })
    }

    fn local_mac(&self, _port: u16) -> MacAddress {
        self.mac
    }
}
