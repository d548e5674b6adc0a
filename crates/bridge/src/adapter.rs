//! Bridges to foreign digital-voice networks.
//!
//! An external adapter speaks the remote network's protocol behind an
//! opaque boundary; the reflector only ever exchanges native frames with
//! it. The manager schedules, retries and reports adapter bridges exactly
//! like native ones; only the transport differs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use event_bus::{typeid, EventBus};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ysfr_core::{Clock, EventKind, Handle, ReflectorEvent};

use crate::backoff::{backoff_delay, PERMANENT_BACKOFF_CAP, SCHEDULED_BACKOFF_CAP};
use crate::config::{BridgeConfig, BridgeKind};
use crate::state::{BridgeState, BridgeStatus, Shared};

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("adapter failed to connect: {0}")]
    Connect(String),
    #[error("adapter failed to close: {0}")]
    Close(String),
    #[error("adapter rejected a frame: {0}")]
    Inject(String),
}

/// Rolling counters reported by an adapter.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AdapterStats {
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallDirection {
    /// From the foreign network towards local peers.
    Inbound,
    /// From local peers towards the foreign network.
    Outbound,
}

/// A voice call currently relayed by the adapter.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCall {
    pub direction: CallDirection,
    pub source: String,
    pub destination: String,
    pub talkgroup: Option<String>,
    pub started_at: u64,
}

/// Contract an external network adapter implements.
///
/// Frames reconstructed from the foreign network are delivered through
/// the sink installed with [`ExternalAdapter::set_native_frame_sink`];
/// frames from the reflector fan-out arrive via
/// [`ExternalAdapter::inject_native_frame`].
#[async_trait]
pub trait ExternalAdapter: Send + Sync {
    async fn start(&self, cancellation: CancellationToken) -> Result<(), AdapterError>;
    async fn stop(&self) -> Result<(), AdapterError>;
    async fn inject_native_frame(&self, frame: &[u8]) -> Result<(), AdapterError>;
    fn statistics(&self) -> AdapterStats;
    fn active_call(&self) -> Option<ActiveCall>;
    fn set_native_frame_sink(&self, sink: flume::Sender<Vec<u8>>);
}

/// A bridge whose transport is an external adapter.
#[derive(Clone)]
pub struct AdapterBridge<C: Clock> {
    name: String,
    config: BridgeConfig,
    adapter: Arc<dyn ExternalAdapter>,
    core: Handle,
    event_bus: EventBus,
    clock: C,
    pub(crate) shared: Arc<Mutex<Shared>>,
}

impl<C: Clock> AdapterBridge<C> {
    pub fn new(
        config: BridgeConfig,
        adapter: Arc<dyn ExternalAdapter>,
        core: Handle,
        full_event_bus: &EventBus,
        clock: C,
    ) -> Self {
        let event_bus = full_event_bus
            .extract(&typeid![ReflectorEvent], &[])
            .expect("event channels must be presented");

        Self {
            name: config.name.clone(),
            config,
            adapter,
            core,
            event_bus,
            clock,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn status(&self) -> BridgeStatus {
        let mut status = self
            .shared
            .lock()
            .unwrap()
            .status(&self.name, BridgeKind::External);
        let stats = self.adapter.statistics();
        status.packets_rx = stats.packets_rx;
        status.packets_tx = stats.packets_tx;
        status.bytes_rx = stats.bytes_rx;
        status.bytes_tx = stats.bytes_tx;
        status
    }

    pub fn active_call(&self) -> Option<ActiveCall> {
        self.adapter.active_call()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().unwrap().state == BridgeState::Connected
    }

    pub fn set_next_schedule(&self, next: Option<ysfr_core::LocalTime>) {
        let mut shared = self.shared.lock().unwrap();
        shared.next_scheduled = next;
        if shared.state == BridgeState::Disconnected && next.is_some() {
            shared.state = BridgeState::Scheduled;
        }
    }

    pub fn disconnect(&self) {
        if let Some(session) = self.shared.lock().unwrap().session.clone() {
            session.cancel();
        }
    }

    pub async fn run_permanent(&self, cancellation: CancellationToken) {
        self.run_session_loop(cancellation, PERMANENT_BACKOFF_CAP).await
    }

    pub async fn run_scheduled(&self, cancellation: CancellationToken) {
        self.run_session_loop(cancellation, SCHEDULED_BACKOFF_CAP).await
    }

    async fn run_session_loop(&self, cancellation: CancellationToken, backoff_cap: Duration) {
        self.shared.lock().unwrap().session = Some(cancellation.clone());
        let mut rng = fastrand::Rng::new();

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            match self.session(&cancellation).await {
                Ok(()) => break,
                Err(err) => {
                    warn!(bridge = %self.name, %err, "adapter session failed");
                    self.set_state(BridgeState::Failed, Some(err.to_string()));
                }
            }

            let retry_count = {
                let mut shared = self.shared.lock().unwrap();
                shared.retry_count += 1;
                shared.retry_count
            };
            if self.config.max_retries > 0 && retry_count >= self.config.max_retries {
                warn!(bridge = %self.name, retry_count, "adapter bridge giving up");
                break;
            }

            let delay = backoff_delay(
                self.config.retry_delay(),
                retry_count.saturating_sub(1),
                backoff_cap,
                &mut rng,
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => break,
            }
        }

        self.shared.lock().unwrap().session = None;
    }

    /// One adapter session: start, pump frames both ways, stop.
    async fn session(&self, cancellation: &CancellationToken) -> Result<(), AdapterError> {
        self.set_state(BridgeState::Connecting, None);

        let (sink_tx, sink_rx) = flume::bounded(ysfr_core::handle::BRIDGE_QUEUE_CAPACITY);
        self.adapter.set_native_frame_sink(sink_tx);
        self.adapter.start(cancellation.child_token()).await?;

        let (queue_tx, queue_rx) = ysfr_core::bridge_queue();
        if self.core.register_bridge(&self.name, queue_tx).is_err() {
            let _ = self.adapter.stop().await;
            return Ok(());
        }

        {
            let now = self.clock.local_time();
            let mut shared = self.shared.lock().unwrap();
            shared.connected_at = Some(now);
            shared.retry_count = 0;
            shared.last_error = None;
        }
        self.set_state(BridgeState::Connected, None);
        info!(bridge = %self.name, "adapter bridge started");

        loop {
            tokio::select! {
                frame = queue_rx.recv_async() => {
                    let Ok(frame) = frame else { break };
                    if let Err(err) = self.adapter.inject_native_frame(&frame).await {
                        debug!(bridge = %self.name, %err, "adapter rejected a frame");
                    }
                }
                reconstructed = sink_rx.recv_async() => {
                    let Ok(frame) = reconstructed else { break };
                    let _ = self.core.inject_frame(&self.name, frame);
                }
                _ = cancellation.cancelled() => break,
            }
        }

        let _ = self.core.unregister_bridge(&self.name);
        if let Err(err) = self.adapter.stop().await {
            warn!(bridge = %self.name, %err, "adapter stop failed");
        }
        self.set_state(BridgeState::Disconnected, None);
        Ok(())
    }

    fn set_state(&self, state: BridgeState, error: Option<String>) {
        let now = self.clock.local_time();
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.state == state {
                return;
            }
            shared.state = state;
            if error.is_some() {
                shared.last_error = error;
            }
            if state == BridgeState::Disconnected {
                shared.disconnected_at = Some(now);
            }
        }

        self.event_bus.publish(ReflectorEvent {
            kind: EventKind::BridgeStateChange,
            callsign: self.name.clone(),
            address: "-".to_owned(),
            timestamp: now.as_millis(),
            duration_ms: None,
            detail: Some(state.to_string()),
        });
    }
}
