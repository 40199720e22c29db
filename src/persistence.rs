//! Snapshot and restore of instance state and containment.
//!
//! Only data that survives a code swap is captured: which blueprint each
//! instance belongs to, its state store, and the containment forest.
//! Schedules, fights and compiled code are rebuilt on restore.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::blueprint::BlueprintId;
use crate::driver::Driver;
use crate::error::DriverError;
use crate::state_store::StateStore;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInstance {
    pub id: String,
    pub blueprint: BlueprintId,
    #[serde(default)]
    pub state: StateStore,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    #[serde(default)]
    pub taken_at_ms: u64,
    pub instances: Vec<SnapshotInstance>,
    /// `(member, container)` pairs.
    #[serde(default)]
    pub containment: Vec<(String, String)>,
}

/// Clone sequence number encoded in a clone name such as `npc/rat#12`.
fn clone_suffix(name: &str, blueprint: &BlueprintId) -> Option<u64> {
    let rest = name.strip_prefix(blueprint.as_str())?.strip_prefix('#')?;
    rest.parse().ok()
}

impl Driver {
    pub fn snapshot(&self) -> WorldSnapshot {
        let instances = self
            .instances()
            .iter()
            .map(|inst| SnapshotInstance {
                id: inst.name.clone(),
                blueprint: inst.blueprint.clone(),
                state: inst.state.borrow().clone(),
            })
            .collect();
        let mut containment: Vec<(String, String)> = self
            .containers()
            .edges()
            .map(|(member, container)| (self.name_of(member), self.name_of(container)))
            .collect();
        containment.sort();
        WorldSnapshot {
            taken_at_ms: self.now_ms(),
            instances,
            containment,
        }
    }

    /// Rebuilds a snapshot into an empty world. Every referenced blueprint is
    /// loaded before anything is created, so a broken blueprint leaves the
    /// world empty. Load hooks run after containment is restored, with the
    /// saved state already in place.
    pub fn restore(&mut self, snapshot: WorldSnapshot) -> Result<usize, DriverError> {
        if !self.instances.is_empty() {
            return Err(DriverError::WorldNotEmpty(self.instances.len()));
        }
        let mut seen = HashSet::new();
        for entry in &snapshot.instances {
            if !seen.insert(entry.id.as_str()) {
                return Err(DriverError::DuplicateObject(entry.id.clone()));
            }
        }
        let mut modules = Vec::with_capacity(snapshot.instances.len());
        for entry in &snapshot.instances {
            modules.push(self.ensure_loaded(&entry.blueprint)?);
        }

        let mut restored = Vec::with_capacity(snapshot.instances.len());
        for (entry, module) in snapshot.instances.into_iter().zip(modules) {
            if let Some(seq) = clone_suffix(&entry.id, &entry.blueprint) {
                self.blueprints.advance_clone_seq(&entry.blueprint, seq);
            }
            let id = self.instances.insert(entry.id, entry.blueprint, module, entry.state);
            restored.push(id);
        }

        for (member, container) in &snapshot.containment {
            let (Some(member_id), Some(container_id)) = (self.resolve(member), self.resolve(container)) else {
                tracing::warn!(member = %member, container = %container, "containment edge skipped");
                continue;
            };
            if let Err(err) = self.containers.move_to(member_id, Some(container_id)) {
                tracing::warn!(member = %member, container = %container, error = %err, "containment edge skipped");
            }
        }
        self.touch_world();

        for id in &restored {
            self.sync_heartbeat(*id);
            self.run_load_hook(*id);
        }
        tracing::info!(instances = restored.len(), "world restored");
        Ok(restored.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_suffix_reads_sequence() {
        let bp = BlueprintId::from("npc/rat");
        assert_eq!(clone_suffix("npc/rat#12", &bp), Some(12));
        assert_eq!(clone_suffix("npc/rat", &bp), None);
        assert_eq!(clone_suffix("npc/ratking#3", &bp), None);
    }

    #[test]
    fn snapshot_json_tolerates_missing_fields() {
        let snapshot: WorldSnapshot = serde_json::from_str(
            r#"{"instances": [{"id": "room/start", "blueprint": "room/start"}]}"#,
        )
        .expect("parse");
        assert_eq!(snapshot.instances.len(), 1);
        assert!(snapshot.instances[0].state.is_empty());
        assert!(snapshot.containment.is_empty());
    }
}
