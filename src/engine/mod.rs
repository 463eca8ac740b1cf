//! Protocol engines of the control plane
//!
//! Each engine is a synchronous state machine driven by the stack: inbound
//! PDUs and timer ticks go in, PDUs to transmit and events come out. None of
//! them performs I/O.

pub mod acmp;
pub mod adp;
pub mod aecp;
pub mod entity_model;

#[cfg(test)]
mod tests;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::protocol::aem::{COUNTER_COUNT, avb_interface_counters};

pub use acmp::{AcmpEngine, AcmpOutput, ConnectionState, StreamConnection};
pub use adp::{AdpEngine, AdpOutcome, AdvertiseDue};
pub use aecp::{AecpController, AecpResponder, ControllerEvent, ResponderContext, ResponderOutput};
pub use entity_model::LocalEntity;

/// Channel completing an application request
pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Complete an application request; a dropped receiver is not an error
pub(crate) fn send_reply<T>(reply: Reply<T>, result: Result<T>) {
    let _ = reply.send(result);
}

/// Counters of the AVB_INTERFACE descriptor kept by the stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    /// Times the link came up
    pub link_up: u32,
    /// Control frames sent
    pub frames_tx: u32,
    /// Control frames received
    pub frames_rx: u32,
    /// Local grandmaster changes
    pub gptp_gm_changed: u32,
}

impl InterfaceCounters {
    /// GET_COUNTERS layout as `(valid bitmap, values)`
    #[must_use]
    pub fn to_counters(&self) -> (u32, [u32; COUNTER_COUNT]) {
        let mut values = [0u32; COUNTER_COUNT];
        let mut valid = 0u32;
        for (index, value) in [
            (avb_interface_counters::LINK_UP, self.link_up),
            (avb_interface_counters::FRAMES_TX, self.frames_tx),
            (avb_interface_counters::FRAMES_RX, self.frames_rx),
            (avb_interface_counters::GPTP_GM_CHANGED, self.gptp_gm_changed),
        ] {
            values[index] = value;
            valid |= 1 << index;
        }
        (valid, values)
    }
}
