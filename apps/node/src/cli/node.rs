use std::time::Duration;

use event_bus::EventBus;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use ysfr_bridge::{BridgeKind, BridgeManager};
use ysfr_core::{Reflector, ReflectorEvent, SystemClock};

use crate::config::NodeConfig;

/// Capacity of each event-bus channel.
const DEFAULT_CHANNEL_SIZE: usize = 1000;
/// The limit of time to wait for the node to shut down.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Node encapsulates the reflector services' startup.
pub struct Node {
    config: NodeConfig,
    event_bus: EventBus,

    cancellation: CancellationToken,
    task_tracker: TaskTracker,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let mut event_bus = EventBus::default();
        event_bus.register::<ReflectorEvent>(Some(DEFAULT_CHANNEL_SIZE));

        Self {
            config,
            event_bus,
            cancellation: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Resolves if any service cancels the shared token.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub async fn run(&self) -> eyre::Result<()> {
        let reflector_config = self.config.server.to_reflector_config()?;
        let callsign = reflector_config.callsign.clone();

        let reflector = Reflector::bind(
            reflector_config,
            self.config.blocklist.to_blocklist(),
            &self.event_bus,
            SystemClock,
        )
        .await?;
        let handle = reflector.handle();

        self.task_tracker
            .spawn(reflector.run(self.cancellation.clone()));

        let mut manager = BridgeManager::new(
            callsign,
            handle,
            self.event_bus.clone(),
            SystemClock,
        );
        for bridge in &self.config.bridges {
            match bridge.kind {
                BridgeKind::Native => manager.add_native(bridge.clone())?,
                // Adapter bridges need an adapter implementation compiled
                // in; none ships with the plain daemon.
                BridgeKind::External => {
                    warn!(bridge = %bridge.name, "no external adapter is available, skipping");
                }
            }
        }
        self.task_tracker
            .spawn(manager.run(self.cancellation.clone()));

        self.spawn_event_log();
        self.task_tracker.close();

        Ok(())
    }

    /// Forward reflector events to the log as JSON. This is the seam
    /// where dashboard and MQTT forwarders would subscribe.
    fn spawn_event_log(&self) {
        let events = self.event_bus.subscribe::<ReflectorEvent>();
        let cancellation = self.cancellation.clone();

        self.task_tracker.spawn(async move {
            loop {
                select! {
                    event = events.recv() => {
                        let Ok(event) = event else { return };
                        match serde_json::to_string(&event) {
                            Ok(json) => info!(target: "events", "{json}"),
                            Err(err) => warn!("failed to serialize event: {err}"),
                        }
                    }
                    _ = cancellation.cancelled() => return,
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        info!("Shutting down the reflector, finishing in-flight work...");

        self.cancellation.cancel();

        let timeout = self
            .config
            .shutdown_timeout
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        select! {
            // Wait until all tasks are finished
            _ = self.task_tracker.wait() => {},
            // Or wait for and exit by timeout
            _ = sleep(Duration::from_secs(timeout)) => {
                info!("Shutdown timeout reached, exiting...");
            },
        }
    }
}
