//! Outbound bridges to other reflectors and foreign networks.
//!
//! A bridge runner owns one outbound session; the manager owns the fleet,
//! the cron schedules, and missed-window recovery.

pub mod adapter;
pub mod backoff;
pub mod config;
pub mod manager;
pub mod runner;
pub mod schedule;
pub mod state;

pub use adapter::{
    ActiveCall, AdapterBridge, AdapterError, AdapterStats, CallDirection, ExternalAdapter,
};
pub use config::{BridgeConfig, BridgeKind};
pub use manager::{Bridge, BridgeManager};
pub use runner::NativeBridge;
pub use schedule::{parse_schedule, ScheduleError, ScheduleRecord};
pub use state::{BridgeState, BridgeStatus};
