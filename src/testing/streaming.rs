//! Streaming backend that records every call

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::net::{StreamHandle, StreamParams, StreamingBackend};
use crate::protocol::acmp::AcmpStatus;
use crate::protocol::aecp::AecpStatus;
use crate::protocol::aem::COUNTER_COUNT;

/// STREAM counter indices reported by [`RecordingStreaming`]
const STREAM_START: usize = 0;
const STREAM_STOP: usize = 1;

/// Calls received so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingLog {
    /// `start_stream` calls
    pub started: Vec<StreamParams>,
    /// `stop_stream` calls
    pub stopped: Vec<StreamHandle>,
    /// `reserve_talker` calls that succeeded
    pub reserved: Vec<StreamParams>,
    /// `release_talker` calls
    pub released: Vec<StreamHandle>,
    /// `bind_listener` calls that succeeded
    pub bound: Vec<StreamParams>,
    /// `unbind_listener` calls
    pub unbound: Vec<StreamHandle>,
}

/// Failures to inject
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingFaults {
    /// Status `start_stream` fails with
    pub start: Option<AecpStatus>,
    /// Status `reserve_talker` fails with
    pub reserve: Option<AcmpStatus>,
    /// Status `bind_listener` fails with
    pub bind: Option<AcmpStatus>,
}

#[derive(Debug, Default)]
struct Shared {
    log: StreamingLog,
    faults: StreamingFaults,
}

/// Recording data plane.
///
/// Clones share their state: keep one and hand another to the stack.
#[derive(Debug, Clone, Default)]
pub struct RecordingStreaming {
    shared: Arc<Mutex<Shared>>,
}

impl RecordingStreaming {
    /// Backend accepting everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the injected failures
    pub fn set_faults(&self, faults: StreamingFaults) {
        self.shared().faults = faults;
    }

    /// Copy of the calls received so far
    #[must_use]
    pub fn log(&self) -> StreamingLog {
        self.shared().log.clone()
    }
}

impl StreamingBackend for RecordingStreaming {
    fn start_stream(&mut self, params: &StreamParams) -> Result<(), AecpStatus> {
        let mut shared = self.shared();
        if let Some(status) = shared.faults.start {
            return Err(status);
        }
        shared.log.started.push(params.clone());
        Ok(())
    }

    fn stop_stream(&mut self, handle: StreamHandle) -> Result<(), AecpStatus> {
        self.shared().log.stopped.push(handle);
        Ok(())
    }

    fn reserve_talker(&mut self, params: &StreamParams) -> Result<(), AcmpStatus> {
        let mut shared = self.shared();
        if let Some(status) = shared.faults.reserve {
            return Err(status);
        }
        shared.log.reserved.push(params.clone());
        Ok(())
    }

    fn release_talker(&mut self, handle: StreamHandle) {
        self.shared().log.released.push(handle);
    }

    fn bind_listener(&mut self, params: &StreamParams) -> Result<(), AcmpStatus> {
        let mut shared = self.shared();
        if let Some(status) = shared.faults.bind {
            return Err(status);
        }
        shared.log.bound.push(params.clone());
        Ok(())
    }

    fn unbind_listener(&mut self, handle: StreamHandle) {
        self.shared().log.unbound.push(handle);
    }

    fn stream_counters(&self, handle: StreamHandle) -> Option<(u32, [u32; COUNTER_COUNT])> {
        let shared = self.shared();
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        let mut counters = [0u32; COUNTER_COUNT];
        counters[STREAM_START] = count(
            shared
                .log
                .started
                .iter()
                .filter(|p| p.handle == handle)
                .count(),
        );
        counters[STREAM_STOP] = count(shared.log.stopped.iter().filter(|h| **h == handle).count());
        Some(((1 << STREAM_START) | (1 << STREAM_STOP), counters))
    }
}
