//! Liveness probing for a single connection.
//!
//! The monitor is owned by the connection's event loop and ticks as one branch of its `select!`,
//! so it cannot outlive the connection.
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// What the event loop must do after a heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
    /// The peer was heard from since the last tick; send another probe
    Probe,
    /// Nothing was heard since the last probe; the link is presumed dead
    Terminate,
}

pub(crate) struct HeartbeatMonitor {
    alive: bool,
    interval: Interval,
}

impl HeartbeatMonitor {
    /// A monitor for the configured interval, if there is one.  A zero interval disables the
    /// heartbeat just like `None`.
    pub fn from_config(interval: Option<Duration>) -> Option<Self> {
        interval.filter(|period| !period.is_zero()).map(Self::new)
    }

    /// The first tick happens one full `period` from now.  `period` must be non-zero.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { alive: true, interval }
    }

    /// Any traffic from the peer counts as proof of life
    pub fn on_traffic(&mut self) {
        self.alive = true;
    }

    /// Wait for the next tick and decide what to do about it
    pub async fn tick(&mut self) -> HeartbeatAction {
        self.interval.tick().await;
        if self.alive {
            self.alive = false;
            HeartbeatAction::Probe
        } else {
            HeartbeatAction::Terminate
        }
    }
}

/// Wait for the next tick of an optional monitor.  Never completes if there is no monitor.
pub(crate) async fn next_tick(monitor: Option<&mut HeartbeatMonitor>) -> HeartbeatAction {
    match monitor {
        Some(monitor) => monitor.tick().await,
        None => std::future::pending().await,
    }
}
