//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use avdecc::net::StaticGptp;
use avdecc::testing::{RecordingStreaming, VirtualNetwork};
use avdecc::{AvdeccConfig, AvdeccEvent, AvdeccHandle, AvdeccStack, EntityId};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

static INIT: Once = Once::new();

/// Initialize logging once per test binary
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("avdecc=debug")
            .with_test_writer()
            .try_init();
    });
}

/// A stack running on the virtual network
pub struct Node {
    pub handle: AvdeccHandle,
    pub streaming: RecordingStreaming,
}

impl Node {
    pub fn entity_id(&self) -> EntityId {
        self.handle.entity_id()
    }
}

/// Attach a stack for `config` to `network` and start it
pub fn spawn_node(network: &VirtualNetwork, config: AvdeccConfig) -> Node {
    let (port, frames) = network.attach(config.mac_address);
    let streaming = RecordingStreaming::new();
    let stack = AvdeccStack::new(config, port, streaming.clone(), StaticGptp::default())
        .expect("valid configuration");
    Node {
        handle: stack.spawn(frames),
        streaming,
    }
}

/// Wait until `handle` has `entity_id` in its directory
pub async fn wait_for_entity(handle: &AvdeccHandle, entity_id: EntityId) {
    timeout(Duration::from_secs(30), async {
        loop {
            if handle.entity(entity_id).await.unwrap().is_some() {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{entity_id} was never discovered"));
}

/// Wait for the first event matching `pred`
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<AvdeccEvent>,
    within: Duration,
    pred: impl Fn(&AvdeccEvent) -> bool,
) -> AvdeccEvent {
    timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event was not published")
}
