//! The bridge manager: owns the fleet, the cron loop and the
//! missed-schedule recovery sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use event_bus::EventBus;
use eyre::{bail, WrapErr};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use ysfr_core::{Clock, Handle, LocalTime};
use ysfr_protocol::Callsign;

use crate::adapter::{AdapterBridge, ExternalAdapter};
use crate::config::{BridgeConfig, BridgeKind};
use crate::runner::NativeBridge;
use crate::schedule::ScheduleRecord;
use crate::state::BridgeStatus;

/// Cron firings are detected at this granularity.
const SCHEDULE_TICK: Duration = Duration::from_secs(1);
/// Cadence of the missed-schedule recovery sweep.
const RECOVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A bridge of either transport, behind one capability set. The manager
/// never looks past this.
#[derive(Clone)]
pub enum Bridge<C: Clock> {
    Native(NativeBridge<C>),
    External(AdapterBridge<C>),
}

impl<C: Clock> Bridge<C> {
    pub fn name(&self) -> &str {
        match self {
            Self::Native(bridge) => bridge.name(),
            Self::External(bridge) => bridge.name(),
        }
    }

    pub fn kind(&self) -> BridgeKind {
        match self {
            Self::Native(_) => BridgeKind::Native,
            Self::External(_) => BridgeKind::External,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        match self {
            Self::Native(bridge) => bridge.config(),
            Self::External(bridge) => bridge.config(),
        }
    }

    pub fn status(&self) -> BridgeStatus {
        match self {
            Self::Native(bridge) => bridge.status(),
            Self::External(bridge) => bridge.status(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::Native(bridge) => bridge.is_connected(),
            Self::External(bridge) => bridge.is_connected(),
        }
    }

    pub fn set_next_schedule(&self, next: Option<LocalTime>) {
        match self {
            Self::Native(bridge) => bridge.set_next_schedule(next),
            Self::External(bridge) => bridge.set_next_schedule(next),
        }
    }

    pub fn disconnect(&self) {
        match self {
            Self::Native(bridge) => bridge.disconnect(),
            Self::External(bridge) => bridge.disconnect(),
        }
    }

    pub async fn run_permanent(&self, cancellation: CancellationToken) {
        match self {
            Self::Native(bridge) => bridge.run_permanent(cancellation).await,
            Self::External(bridge) => bridge.run_permanent(cancellation).await,
        }
    }

    pub async fn run_scheduled(&self, cancellation: CancellationToken) {
        match self {
            Self::Native(bridge) => bridge.run_scheduled(cancellation).await,
            Self::External(bridge) => bridge.run_scheduled(cancellation).await,
        }
    }
}

/// Owns every configured bridge and drives their lifecycles.
pub struct BridgeManager<C: Clock> {
    bridges: HashMap<String, Bridge<C>>,
    schedules: HashMap<String, ScheduleRecord>,
    sessions: HashMap<String, JoinHandle<()>>,
    callsign: Callsign,
    core: Handle,
    event_bus: EventBus,
    clock: C,
}

impl<C: Clock> BridgeManager<C> {
    /// `callsign` is the reflector's own, used by bridges that don't
    /// configure one.
    pub fn new(callsign: Callsign, core: Handle, event_bus: EventBus, clock: C) -> Self {
        Self {
            bridges: HashMap::new(),
            schedules: HashMap::new(),
            sessions: HashMap::new(),
            callsign,
            core,
            event_bus,
            clock,
        }
    }

    /// Register a native bridge. Configuration errors (missing remote,
    /// unparseable cron) are fatal to startup.
    pub fn add_native(&mut self, config: BridgeConfig) -> eyre::Result<()> {
        let callsign = self.bridge_callsign(&config)?;
        let bridge = NativeBridge::new(
            config.clone(),
            callsign,
            self.core.clone(),
            &self.event_bus,
            self.clock.clone(),
        )
        .wrap_err_with(|| format!("invalid bridge `{}`", config.name))?;
        self.insert(config, Bridge::Native(bridge))
    }

    /// Register an adapter-backed bridge.
    pub fn add_external(
        &mut self,
        config: BridgeConfig,
        adapter: Arc<dyn ExternalAdapter>,
    ) -> eyre::Result<()> {
        let bridge = AdapterBridge::new(
            config.clone(),
            adapter,
            self.core.clone(),
            &self.event_bus,
            self.clock.clone(),
        );
        self.insert(config, Bridge::External(bridge))
    }

    fn bridge_callsign(&self, config: &BridgeConfig) -> eyre::Result<Callsign> {
        match &config.callsign {
            Some(callsign) => Callsign::new(callsign)
                .wrap_err_with(|| format!("invalid callsign for bridge `{}`", config.name)),
            None => Ok(self.callsign.clone()),
        }
    }

    fn insert(&mut self, config: BridgeConfig, bridge: Bridge<C>) -> eyre::Result<()> {
        let name = config.name.clone();
        if self.bridges.contains_key(&name) {
            bail!("duplicate bridge name `{name}`");
        }

        if let Some(expr) = config.schedule.as_deref() {
            if config.permanent {
                warn!(
                    bridge = %name,
                    "bridge is both permanent and scheduled; permanent wins, schedule ignored"
                );
            } else {
                let record = ScheduleRecord::new(expr, config.duration())
                    .wrap_err_with(|| format!("invalid schedule for bridge `{name}`"))?;
                self.schedules.insert(name.clone(), record);
            }
        }

        self.bridges.insert(name, bridge);
        Ok(())
    }

    /// Status of every bridge, for telemetry and snapshots.
    pub fn statuses(&self) -> Vec<BridgeStatus> {
        let mut statuses: Vec<BridgeStatus> = self.bridges.values().map(Bridge::status).collect();
        for status in &mut statuses {
            if let Some(record) = self.schedules.get(&status.name) {
                status.missed_windows = record.missed_windows;
            }
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Drive the fleet until cancelled.
    pub async fn run(mut self, cancellation: CancellationToken) {
        self.startup(&cancellation);

        let mut schedule_timer = tokio::time::interval(SCHEDULE_TICK);
        let mut recovery_timer = tokio::time::interval(RECOVERY_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = schedule_timer.tick() => self.schedule_tick(&cancellation),
                _ = recovery_timer.tick() => self.recovery_sweep(&cancellation),
                _ = cancellation.cancelled() => {
                    trace!("cancellation received, stopping bridge manager");
                    return;
                }
            }
        }
    }

    /// Spawn permanent bridges, prime schedules, and recover sessions
    /// whose window is already underway.
    fn startup(&mut self, cancellation: &CancellationToken) {
        let now = self.clock.local_time();
        let names: Vec<String> = self.bridges.keys().cloned().collect();

        for name in names {
            let bridge = self.bridges.get(&name).expect("bridge was just listed");

            if self.is_permanent(&name) {
                info!(bridge = %name, "starting permanent bridge");
                let bridge = bridge.clone();
                let token = cancellation.child_token();
                let handle = tokio::spawn(async move { bridge.run_permanent(token).await });
                self.sessions.insert(name, handle);
                continue;
            }

            let Some(record) = self.schedules.get_mut(&name) else {
                continue;
            };
            record.compute_next(now);
            bridge.set_next_schedule(record.next_execution);

            // Missed-schedule recovery: the process may have started in
            // the middle of a window.
            if let Some((start, end)) = record.current_window(now) {
                record.last_execution = Some(start);
                let remaining: Duration = (end - now).into();
                info!(
                    bridge = %name,
                    ?remaining,
                    "inside a scheduled window at startup, launching session"
                );
                self.launch_session(&name, remaining, cancellation);
            }
        }
    }

    fn is_permanent(&self, name: &str) -> bool {
        // The permanent flag always wins over a schedule.
        self.bridges
            .get(name)
            .is_some_and(|bridge| bridge.config().permanent)
    }

    /// Fire sessions whose scheduled instant has arrived.
    fn schedule_tick(&mut self, cancellation: &CancellationToken) {
        let now = self.clock.local_time();
        let due: Vec<String> = self
            .schedules
            .iter()
            .filter(|(_, record)| record.next_execution.is_some_and(|next| next <= now))
            .map(|(name, _)| name.clone())
            .collect();

        for name in due {
            let record = self.schedules.get_mut(&name).expect("record was listed");
            let fired_at = record.next_execution.expect("record is due");
            record.last_execution = Some(fired_at);
            record.compute_next(now);
            let duration = record.duration;
            let next = record.next_execution;

            if let Some(bridge) = self.bridges.get(&name) {
                bridge.set_next_schedule(next);
            }
            debug!(bridge = %name, "schedule fired");
            self.launch_session(&name, duration, cancellation);
        }
    }

    /// Re-launch any scheduled bridge that should be up right now but
    /// isn't, for the remainder of its window.
    fn recovery_sweep(&mut self, cancellation: &CancellationToken) {
        let now = self.clock.local_time();
        let mut recovered: Vec<(String, Duration)> = Vec::new();

        for (name, record) in &mut self.schedules {
            let Some((start, end)) = record.current_window(now) else {
                continue;
            };
            let missed = record.last_execution.map_or(true, |last| last < start);
            if !missed {
                continue;
            }
            let Some(bridge) = self.bridges.get(name) else {
                continue;
            };
            if bridge.is_connected() {
                continue;
            }
            if self
                .sessions
                .get(name)
                .is_some_and(|session| !session.is_finished())
            {
                continue;
            }

            record.last_execution = Some(start);
            record.missed_windows += 1;
            warn!(
                bridge = %name,
                missed_windows = record.missed_windows,
                "missed scheduled window, recovering for the remainder"
            );
            recovered.push((name.clone(), (end - now).into()));
        }

        for (name, remaining) in recovered {
            self.launch_session(&name, remaining, cancellation);
        }
    }

    /// Spawn one scheduled session of the given length. A still-running
    /// session for the same bridge is never interrupted.
    fn launch_session(&mut self, name: &str, duration: Duration, parent: &CancellationToken) {
        if self
            .sessions
            .get(name)
            .is_some_and(|session| !session.is_finished())
        {
            trace!(bridge = %name, "session already running, not launching another");
            return;
        }
        let Some(bridge) = self.bridges.get(name).cloned() else {
            return;
        };

        let session = parent.child_token();
        let deadline = session.clone();
        let handle = tokio::spawn(async move {
            // The window deadline cancels the session; the runner unwinds
            // and sends its unlink before this task finishes.
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => deadline.cancel(),
                    _ = deadline.cancelled() => {}
                }
            });
            bridge.run_scheduled(session).await;
        });
        self.sessions.insert(name.to_owned(), handle);
    }
}
