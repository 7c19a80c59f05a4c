//! Stuck-instance watchdog.
//!
//! An instance that reports zero connected peers becomes idle.  Once it has
//! been idle for longer than the threshold, and has not been restarted within
//! the cooldown window, it is restarted and an alert is raised.  Any sign of
//! life returns it to active.

use std::collections::HashMap;

use log::{debug, error, info};

use crate::alert::AlertSink;
use crate::runtime::ContainerRuntime;
use crate::types::PeerCount;

/// Per-instance idle and restart bookkeeping, in unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogState {
    pub idle_since: Option<u64>,
    pub last_restart: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Active,
    Idle { for_secs: u64 },
    CoolingDown,
    Restarted,
    RestartFailed,
}

pub struct Watchdog {
    idle_threshold_secs: u64,
    cooldown_secs: u64,
    states: HashMap<String, WatchdogState>,
}

impl Watchdog {
    pub fn new(idle_threshold_secs: u64, cooldown_secs: u64) -> Self {
        Self {
            idle_threshold_secs,
            cooldown_secs,
            states: HashMap::new(),
        }
    }

    /// Runs one check.  `listed` is every instance currently running;
    /// `observed` holds the peer counts that could be fetched.  Instances
    /// without an observation keep their state untouched.
    pub async fn check(
        &mut self,
        listed: &[String],
        observed: &[(String, PeerCount)],
        runtime: &dyn ContainerRuntime,
        alerts: &dyn AlertSink,
        now: u64,
    ) -> Vec<(String, Verdict)> {
        self.states.retain(|name, _| listed.contains(name));

        let mut verdicts = Vec::with_capacity(observed.len());
        for (instance, peers) in observed {
            if !listed.contains(instance) {
                continue;
            }
            let mut state = self.states.get(instance).copied().unwrap_or_default();
            let verdict = self
                .step(&mut state, instance, *peers, runtime, alerts, now)
                .await;
            self.states.insert(instance.clone(), state);
            debug!("Watchdog {}: {:?}", instance, verdict);
            verdicts.push((instance.clone(), verdict));
        }
        verdicts
    }

    async fn step(
        &self,
        state: &mut WatchdogState,
        instance: &str,
        peers: PeerCount,
        runtime: &dyn ContainerRuntime,
        alerts: &dyn AlertSink,
        now: u64,
    ) -> Verdict {
        if peers.connected > 0 {
            state.idle_since = None;
            return Verdict::Active;
        }

        let since = *state.idle_since.get_or_insert(now);
        let idle_for = now.saturating_sub(since);
        if idle_for <= self.idle_threshold_secs {
            return Verdict::Idle { for_secs: idle_for };
        }

        let cooling = state
            .last_restart
            .is_some_and(|last| now.saturating_sub(last) < self.cooldown_secs);
        if cooling {
            return Verdict::CoolingDown;
        }

        match runtime.restart(instance).await {
            Ok(()) => {
                state.last_restart = Some(now);
                state.idle_since = Some(now);
                info!("Restarted {} after {}s without peers", instance, idle_for);
                alerts
                    .emit(&format!(
                        "{} had no connected peers for {}m and was restarted",
                        instance,
                        idle_for / 60
                    ))
                    .await;
                Verdict::Restarted
            }
            Err(e) => {
                // Cooldown and idle clock stay as they are so the next
                // check retries.
                error!("Watchdog restart of {} failed: {}", instance, e);
                Verdict::RestartFailed
            }
        }
    }

    #[cfg(test)]
    pub fn state(&self, instance: &str) -> Option<&WatchdogState> {
        self.states.get(instance)
    }
}
