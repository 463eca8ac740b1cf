//! Network and data-plane abstraction layer
//!
//! The control engine never touches sockets, media or clocks directly. It
//! talks to a [`Transport`] for control frames, a [`StreamingBackend`] for
//! the data plane and a [`GptpSource`] for the current grandmaster.

mod channel;
mod traits;

#[cfg(test)]
mod tests;

pub use channel::ChannelTransport;
pub use traits::{
    Frame, GptpInfo, GptpSource, NullStreaming, StaticGptp, StreamDirection, StreamHandle,
    StreamParams, StreamingBackend, Transport,
};
