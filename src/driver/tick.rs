use serde::Serialize;

use super::Driver;
use crate::capability::Capability;
use crate::instances::ObjectId;
use crate::sandbox::{HookKind, Invocation};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub now_ms: u64,
    pub heartbeats: usize,
    pub callouts: usize,
    pub deferred: usize,
    pub commands: usize,
    pub combat_rounds: usize,
    pub resets: usize,
}

impl Driver {
    /// One pass of the cooperative loop: heartbeats, callouts, queued player
    /// commands, combat rounds, then periodic resets.
    pub fn tick(&mut self, dt_ms: u64) -> TickReport {
        let now_ms = self.clock.advance(dt_ms);
        let mut report = TickReport {
            now_ms,
            ..TickReport::default()
        };
        report.heartbeats = self.run_heartbeats(now_ms);
        let (fired, deferred) = self.run_callouts(now_ms);
        report.callouts = fired;
        report.deferred = deferred;
        report.commands = self.run_commands();
        report.combat_rounds = self.run_combat_rounds(now_ms);
        report.resets = self.run_resets(now_ms);
        self.try_unload();
        report
    }

    fn run_heartbeats(&mut self, now_ms: u64) -> usize {
        let mut fired = 0;
        for id in self.scheduler.due_heartbeats(now_ms) {
            let Some(blueprint) = self.instances.get(id).map(|inst| inst.blueprint.clone()) else {
                self.scheduler.remove_heartbeat(id);
                continue;
            };
            if self.reloading.contains(&blueprint) {
                continue;
            }
            self.scheduler.reschedule_heartbeat(id, now_ms);
            let Some(outcome) = self.call_hook(id, Capability::Heartbeat, Vec::new(), HookKind::Heartbeat)
            else {
                continue;
            };
            fired += 1;
            self.track_heartbeat_outcome(id, &outcome);
        }
        fired
    }

    /// Counts consecutive heartbeat failures and switches the heartbeat off
    /// once the streak reaches the configured limit.
    fn track_heartbeat_outcome(&mut self, id: ObjectId, outcome: &Invocation) {
        let limit = self.config.fault_streak_limit.max(1);
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        match outcome.failure() {
            None => inst.fault_streak = 0,
            Some(message) => {
                inst.fault_streak += 1;
                if inst.fault_streak >= limit {
                    let reason = format!(
                        "heartbeat disabled after {} consecutive failures: {message}",
                        inst.fault_streak
                    );
                    tracing::warn!(object = %inst.name, blueprint = %inst.blueprint, "{reason}");
                    inst.disabled_reason = Some(reason);
                    self.scheduler.remove_heartbeat(id);
                }
            }
        }
    }

    /// Fires due callouts in `(due, registration)` order, at most
    /// `max_callouts_per_tick` of them. Returns `(fired, deferred)`.
    fn run_callouts(&mut self, now_ms: u64) -> (usize, usize) {
        let budget = self.config.max_callouts_per_tick.max(1);
        let mut fired = 0;
        let mut deferred = Vec::new();

        while fired < budget {
            let Some(callout) = self.scheduler.pop_due(now_ms) else {
                break;
            };
            let Some(current) = self.instances.get(callout.target).map(|inst| inst.module.clone()) else {
                // Target is gone; drop without invoking.
                continue;
            };
            if self.reloading.contains(&callout.blueprint) {
                deferred.push(callout);
                continue;
            }

            let module = callout.pinned.clone().unwrap_or(current);
            self.running_callout = Some(callout.id);
            self.running_cancelled = false;
            let outcome = self.invoke_on(
                callout.target,
                &module,
                &callout.method,
                callout.args.clone(),
                HookKind::Callout,
            );
            self.running_callout = None;
            fired += 1;

            if let Invocation::TimedOut(_) = outcome {
                tracing::warn!(callout = %callout.id, method = %callout.method, "callout abandoned after timeout");
            }
            let keep = callout.repeat_ms.is_some()
                && !self.running_cancelled
                && self.instances.contains(callout.target);
            if keep {
                self.scheduler.repeat(callout);
            }
        }

        let deferred_count = deferred.len();
        for callout in deferred {
            self.scheduler.defer(callout);
        }
        (fired, deferred_count)
    }

    fn run_resets(&mut self, now_ms: u64) -> usize {
        if now_ms < self.next_reset_ms {
            return 0;
        }
        self.next_reset_ms = now_ms.saturating_add(self.config.reset_interval_ms.max(1));
        let targets: Vec<_> = self
            .instances
            .iter()
            .filter(|inst| inst.capabilities.contains(Capability::Reset))
            .map(|inst| inst.id)
            .collect();
        let mut count = 0;
        for id in targets {
            if self.call_hook(id, Capability::Reset, Vec::new(), HookKind::Reset).is_some() {
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!(objects = count, "periodic reset");
        }
        count
    }
}
