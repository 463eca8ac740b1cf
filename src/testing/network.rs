//! In-process network connecting several stacks

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{AvdeccError, Result};
use crate::net::{Frame, Transport};
use crate::types::MacAddress;

/// Depth of each endpoint's inbound queue
const ENDPOINT_QUEUE: usize = 1024;

/// Network condition simulator
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NetworkConditions {
    /// Frame loss probability (0.0 to 1.0)
    pub loss_rate: f64,
}

impl NetworkConditions {
    /// Lossless network
    #[must_use]
    pub fn perfect() -> Self {
        Self { loss_rate: 0.0 }
    }

    /// Network dropping `loss_rate` of all frames
    #[must_use]
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate: loss_rate.clamp(0.0, 1.0),
        }
    }

    /// Should this frame be dropped?
    #[must_use]
    pub fn should_drop(&self) -> bool {
        if self.loss_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(self.loss_rate)
    }
}

#[derive(Debug)]
struct Endpoint {
    mac: MacAddress,
    tx: mpsc::Sender<Frame>,
}

#[derive(Debug, Default)]
struct Segment {
    endpoints: Vec<Endpoint>,
    conditions: NetworkConditions,
    captured: Vec<Frame>,
    dropped: usize,
}

/// Shared Ethernet segment.
///
/// Frames to a multicast address reach every other endpoint; unicast frames
/// reach the endpoint with that MAC. Every frame sent is captured, including
/// the ones the simulated conditions drop.
#[derive(Debug, Clone, Default)]
pub struct VirtualNetwork {
    segment: Arc<Mutex<Segment>>,
}

impl VirtualNetwork {
    /// Lossless network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Network with the given conditions
    #[must_use]
    pub fn with_conditions(conditions: NetworkConditions) -> Self {
        let network = Self::default();
        network.set_conditions(conditions);
        network
    }

    fn segment(&self) -> MutexGuard<'_, Segment> {
        self.segment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the simulated conditions
    pub fn set_conditions(&self, conditions: NetworkConditions) {
        self.segment().conditions = conditions;
    }

    /// Plug in an interface; returns its transport and inbound frames
    #[must_use]
    pub fn attach(&self, mac: MacAddress) -> (VirtualPort, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE);
        let mut segment = self.segment();
        segment.endpoints.retain(|e| e.mac != mac);
        segment.endpoints.push(Endpoint { mac, tx });
        (
            VirtualPort {
                network: self.clone(),
                mac,
            },
            rx,
        )
    }

    /// Unplug an interface; frames sent to it are lost from now on
    pub fn detach(&self, mac: MacAddress) {
        self.segment().endpoints.retain(|e| e.mac != mac);
    }

    /// Frames sent so far
    #[must_use]
    pub fn captured(&self) -> Vec<Frame> {
        self.segment().captured.clone()
    }

    /// Forget captured frames
    pub fn clear_captured(&self) {
        self.segment().captured.clear();
    }

    /// Frames dropped by the simulated conditions or full queues
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.segment().dropped
    }

    fn deliver(&self, frame: Frame) -> Result<()> {
        let mut segment = self.segment();
        if !segment.endpoints.iter().any(|e| e.mac == frame.source) {
            return Err(AvdeccError::transport(frame.port, "interface detached"));
        }
        segment.captured.push(frame.clone());
        if segment.conditions.should_drop() {
            trace!(source = %frame.source, destination = %frame.destination, "frame lost");
            segment.dropped += 1;
            return Ok(());
        }

        let mut dropped = 0;
        for endpoint in &segment.endpoints {
            let wanted = endpoint.mac != frame.source
                && (frame.destination.is_multicast() || frame.destination == endpoint.mac);
            if wanted && endpoint.tx.try_send(frame.clone()).is_err() {
                warn!(endpoint = %endpoint.mac, "inbound queue full, frame dropped");
                dropped += 1;
            }
        }
        segment.dropped += dropped;
        Ok(())
    }
}

/// One interface on a [`VirtualNetwork`]
#[derive(Debug, Clone)]
pub struct VirtualPort {
    network: VirtualNetwork,
    mac: MacAddress,
}

impl VirtualPort {
    /// MAC of this interface
    #[must_use]
    pub fn mac(&self) -> MacAddress {
        self.mac
    }
}

impl Transport for VirtualPort {
    fn send_frame(
        &self,
        port: u16,
        destination: MacAddress,
        ethertype: u16,
        payload: Bytes,
    ) -> Result<()> {
        self.network.deliver(Frame {
            port,
            source: self.mac,
            destination,
            ethertype,
            payload,
        })
    }

    fn local_mac(&self, _port: u16) -> MacAddress {
        self.mac
    }
}
