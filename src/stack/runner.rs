//! Tokio task driving an [`AvdeccStack`]

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{AvdeccHandle, AvdeccStack, Request};
use crate::net::Frame;

/// Depth of the application request queue
const REQUEST_QUEUE: usize = 64;

/// Event loop serializing frames, requests and timers for one port
pub(crate) struct Runner {
    stack: AvdeccStack,
    frames: mpsc::Receiver<Frame>,
    requests: mpsc::Receiver<Request>,
    shutdown: watch::Receiver<bool>,
}

/// Current time on the tokio clock, so paused test time applies
fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

impl Runner {
    /// Spawn the loop and return the handle controlling it
    pub(crate) fn spawn(stack: AvdeccStack, frames: mpsc::Receiver<Frame>) -> AvdeccHandle {
        let (request_tx, requests) = mpsc::channel(REQUEST_QUEUE);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let entity_id = stack.entity_id();
        let events = stack.events().clone();

        let runner = Self {
            stack,
            frames,
            requests,
            shutdown,
        };
        let task = tokio::spawn(runner.run());
        AvdeccHandle {
            entity_id,
            requests: request_tx,
            shutdown: Arc::new(shutdown_tx),
            events,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(mut self) {
        let mut tick = time::interval(self.stack.config().tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames_open = true;

        self.stack.start(now());
        loop {
            let deadline = self.stack.next_deadline();
            tokio::select! {
                frame = self.frames.recv(), if frames_open => {
                    match frame {
                        Some(frame) => self.stack.handle_frame(&frame, now()),
                        None => {
                            warn!(entity_id = %self.stack.entity_id(), "frame channel closed, no more inbound traffic");
                            frames_open = false;
                        }
                    }
                }

                request = self.requests.recv() => {
                    match request {
                        Some(request) => self.stack.submit(request, now()),
                        None => {
                            debug!("all handles dropped");
                            break;
                        }
                    }
                }

                // Retries, expiries and advertisements
                () = sleep_until(deadline) => {}

                // Picks up gPTP changes
                _ = tick.tick() => {}

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(entity_id = %self.stack.entity_id(), "AVDECC runner shutting down");
                        break;
                    }
                }
            }
            self.stack.poll(now());
        }
        self.stack.shutdown();
    }
}
